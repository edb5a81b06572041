//! Cross-mechanism wrap/unwrap behavior through the public context API.

use imp_core::{
    Keystore, LoopbackAgent, SecurityConfig, SecurityContext, SignError, UnwrapMode,
};
use tempfile::TempDir;

fn context_from(toml_text: &str) -> SecurityContext {
    SecurityContext::new(SecurityConfig::from_toml(toml_text).unwrap())
}

fn none_context() -> SecurityContext {
    context_from(
        r#"
        [sign]
        max-ttl = 30
        default-type = "none"
        allowed-types = ["none"]
        "#,
    )
}

fn curve_context(keystore_dir: &std::path::Path, max_ttl: i64) -> SecurityContext {
    context_from(&format!(
        r#"
        [sign]
        max-ttl = {max_ttl}
        default-type = "curve"
        allowed-types = ["curve"]

        [sign.curve]
        keystore-path = "{}"
        "#,
        keystore_dir.display()
    ))
}

fn munge_context() -> SecurityContext {
    let mut ctx = context_from(
        r#"
        [sign]
        max-ttl = 30
        default-type = "munge"
        allowed-types = ["munge"]
        "#,
    );
    ctx.set_credential_agent(Box::new(LoopbackAgent::new("shared host secret")));
    ctx
}

#[test]
fn round_trip_none_matches_wire_shape() {
    let mut ctx = none_context();
    let envelope = ctx.sign_wrap_as(1000, b"hi", None).unwrap().to_string();

    // HEADER.aGk=.none with a base64 header segment.
    let mut parts = envelope.splitn(3, '.');
    let header = parts.next().unwrap();
    assert!(!header.is_empty());
    assert!(header
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='));
    assert_eq!(parts.next().unwrap(), "aGk=");
    assert_eq!(parts.next().unwrap(), "none");

    let unwrapped = ctx.sign_unwrap(&envelope, UnwrapMode::Verify).unwrap();
    assert_eq!(unwrapped.payload, b"hi");
    assert_eq!(unwrapped.userid, 1000);
    assert_eq!(unwrapped.mechanism, "none");
}

#[test]
fn round_trip_all_mechanisms_and_payloads() {
    let keys = TempDir::new().unwrap();
    let uid = nix::unistd::getuid().as_raw();
    Keystore::new(keys.path()).generate(uid).unwrap();

    let payloads: [&[u8]; 3] = [b"", b"hi", &[0u8, 1, 2, 255, 254]];

    for (name, mut ctx) in [
        ("none", none_context()),
        ("munge", munge_context()),
        ("curve", curve_context(keys.path(), 30)),
    ] {
        for payload in payloads {
            let envelope = ctx.sign_wrap_as(uid, payload, Some(name)).unwrap().to_string();
            let unwrapped = ctx.sign_unwrap(&envelope, UnwrapMode::Verify).unwrap();
            assert_eq!(unwrapped.payload, payload, "mechanism {name}");
            assert_eq!(unwrapped.userid, uid, "mechanism {name}");
            assert_eq!(unwrapped.mechanism, name);
        }
    }
}

#[test]
fn wrap_current_uses_real_uid() {
    let mut ctx = none_context();
    let envelope = ctx.sign_wrap(b"payload", None).unwrap().to_string();
    let unwrapped = ctx.sign_unwrap(&envelope, UnwrapMode::Verify).unwrap();
    assert_eq!(unwrapped.userid, nix::unistd::getuid().as_raw());
}

#[test]
fn unknown_mechanism_reported_in_last_error() {
    let mut ctx = none_context();
    assert!(ctx.sign_wrap_as(1000, b"x", Some("bogus")).is_err());
    assert!(ctx.last_error().unwrap().contains("bogus"));
}

#[test]
fn policy_rejection_vs_anymech() {
    // Mint under none, check under a curve-only policy.
    let mut minter = none_context();
    let envelope = minter
        .sign_wrap_as(1000, b"hi", Some("none"))
        .unwrap()
        .to_string();

    let keys = TempDir::new().unwrap();
    let mut checker = curve_context(keys.path(), 30);
    let err = checker
        .sign_unwrap(&envelope, UnwrapMode::Verify)
        .unwrap_err();
    assert!(matches!(err, SignError::PolicyDenied { .. }));

    let unwrapped = checker
        .sign_unwrap_anymech(&envelope, UnwrapMode::Verify)
        .unwrap();
    assert_eq!(unwrapped.payload, b"hi");
    assert_eq!(unwrapped.mechanism, "none");
}

#[test]
fn curve_tamper_detection_across_whole_envelope() {
    let keys = TempDir::new().unwrap();
    let uid = nix::unistd::getuid().as_raw();
    Keystore::new(keys.path()).generate(uid).unwrap();

    let mut ctx = curve_context(keys.path(), 30);
    let envelope = ctx.sign_wrap_as(uid, b"job payload", None).unwrap().to_string();

    // Flip one character in the payload segment.
    let first_dot = envelope.find('.').unwrap();
    let second_dot = first_dot + 1 + envelope[first_dot + 1..].find('.').unwrap();
    let target = first_dot + 1;
    let mut tampered = envelope.clone().into_bytes();
    tampered[target] = if tampered[target] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(tampered).unwrap();
    assert_ne!(tampered, envelope);

    let err = ctx.sign_unwrap(&tampered, UnwrapMode::Verify).unwrap_err();
    assert!(matches!(
        err,
        SignError::SignatureInvalid(_) | SignError::InputMalformed(_)
    ));

    // Same tampering in the signature segment.
    let mut sig_tampered = envelope.clone().into_bytes();
    let sig_pos = second_dot + 1;
    sig_tampered[sig_pos] = if sig_tampered[sig_pos] == b'A' { b'B' } else { b'A' };
    let sig_tampered = String::from_utf8(sig_tampered).unwrap();
    assert!(ctx.sign_unwrap(&sig_tampered, UnwrapMode::Verify).is_err());
}

#[test]
fn curve_payload_tamper_undetected_under_noverify() {
    let keys = TempDir::new().unwrap();
    let uid = nix::unistd::getuid().as_raw();
    Keystore::new(keys.path()).generate(uid).unwrap();

    let mut ctx = curve_context(keys.path(), 30);
    // "hi" -> payload segment "aGk="; rewrite to "aGo=" ("hj").
    let envelope = ctx.sign_wrap_as(uid, b"hi", None).unwrap().to_string();
    let tampered = envelope.replace(".aGk=.", ".aGo=.");
    assert_ne!(tampered, envelope);

    assert!(ctx.sign_unwrap(&tampered, UnwrapMode::Verify).is_err());
    let unwrapped = ctx
        .sign_unwrap(&tampered, UnwrapMode::NoVerify)
        .unwrap();
    assert_eq!(unwrapped.payload, b"hj");
}

#[test]
fn munge_detects_credential_swap() {
    let mut ctx = munge_context();
    let uid = nix::unistd::getuid().as_raw();
    let a = ctx.sign_wrap_as(uid, b"payload a", None).unwrap().to_string();
    let b = ctx.sign_wrap_as(uid, b"payload b", None).unwrap().to_string();

    // Splice a's credential onto b's body.
    let a_sig = a.rsplitn(2, '.').next().unwrap().to_string();
    let b_prefix = b.rsplitn(2, '.').nth(1).unwrap().to_string();
    let spliced = format!("{b_prefix}.{a_sig}");
    assert!(ctx.sign_unwrap(&spliced, UnwrapMode::Verify).is_err());
}

#[test]
fn structural_rejections() {
    let mut ctx = none_context();
    for input in ["", "nodots", "one.dot", "häder.cGF5.none"] {
        assert!(
            matches!(
                ctx.sign_unwrap(input, UnwrapMode::Verify),
                Err(SignError::InputMalformed(_))
            ),
            "input {input:?} should be malformed"
        );
    }
}

#[test]
fn config_validation_failures_surface_through_context() {
    let cases = [
        "[sign]\nmax-ttl = 0\ndefault-type = \"none\"\nallowed-types = [\"none\"]\n",
        "[sign]\nmax-ttl = -7\ndefault-type = \"none\"\nallowed-types = [\"none\"]\n",
        "[sign]\nmax-ttl = 30\ndefault-type = \"none\"\nallowed-types = []\n",
        "[sign]\nmax-ttl = 30\ndefault-type = \"none\"\nallowed-types = [3]\n",
        "[sign]\nmax-ttl = 30\ndefault-type = \"none\"\nallowed-types = [\"nope\"]\n",
        "[sign]\nmax-ttl = 30\ndefault-type = \"nope\"\nallowed-types = [\"none\"]\n",
    ];
    for toml_text in cases {
        let mut ctx = context_from(toml_text);
        assert!(
            ctx.sign_wrap_as(1000, b"x", None).is_err(),
            "config should fail: {toml_text}"
        );
    }
}

#[test]
fn ttl_sentinel_config_accepted() {
    let mut ctx = context_from(
        "[sign]\nmax-ttl = -100\ndefault-type = \"none\"\nallowed-types = [\"none\"]\n",
    );
    assert!(ctx.sign_wrap_as(1000, b"x", None).is_ok());
}

#[test]
fn curve_rejects_envelope_from_unbound_key() {
    // Signer's key is not the one the keystore binds to the claimed uid.
    let signer_keys = TempDir::new().unwrap();
    let checker_keys = TempDir::new().unwrap();
    let uid = nix::unistd::getuid().as_raw();
    Keystore::new(signer_keys.path()).generate(uid).unwrap();
    Keystore::new(checker_keys.path()).generate(uid).unwrap();

    let mut signer = curve_context(signer_keys.path(), 30);
    let envelope = signer.sign_wrap_as(uid, b"hi", None).unwrap().to_string();

    let mut checker = curve_context(checker_keys.path(), 30);
    let err = checker
        .sign_unwrap(&envelope, UnwrapMode::Verify)
        .unwrap_err();
    assert!(matches!(err, SignError::SignatureInvalid(_)));
}
