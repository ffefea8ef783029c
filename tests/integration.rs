#![cfg(unix)]

use std::path::Path;

use gpg_ring::{Error, GpgOptions, Keyring};

/// Runs `script` with `sh -c` in place of gpg. The script sees gpg's
/// arguments as `$1`, `$2`, ... (`$1` is `--homedir`, `$2` the ring).
fn fake_gpg(script: &str) -> GpgOptions {
    GpgOptions {
        program: "sh".into(),
        program_args: vec!["-c".into(), script.into(), "gpg".into()],
        ..GpgOptions::default()
    }
}

fn keyring_with(dir: &Path, script: &str) -> Keyring {
    Keyring::with_options(dir, fake_gpg(script))
}

fn unreachable_gpg(dir: &Path) -> Keyring {
    Keyring::with_options(
        dir,
        GpgOptions {
            program: "/nonexistent/gpg".into(),
            ..GpgOptions::default()
        },
    )
}

const SIGN_SCRIPT: &str = r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output" ]; then out="$2"; fi
    shift
done
pass=$(cat)
printf '%s' "$pass" > "$out"
"#;

const FAILING_SIGN_SCRIPT: &str = r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output" ]; then out="$2"; fi
    shift
done
cat > /dev/null
echo "-----BEGIN PGP SIGNATURE-----" > "$out"
echo "gpg: signing failed: Bad passphrase" >&2
exit 2
"#;

#[tokio::test]
async fn test_invalid_hex_id_rejected_before_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = unreachable_gpg(dir.path());

    let result = keyring.delete_key("DEADBEE").await;
    assert!(matches!(result, Err(Error::InvalidKeyId { .. })));

    let result = keyring.fingerprint("0xNOTAHEX").await;
    assert!(matches!(result, Err(Error::InvalidKeyId { .. })));

    let result = keyring
        .sign_detached("$(id)", "pw", Path::new("data"), Path::new("data.asc"))
        .await;
    assert!(matches!(result, Err(Error::InvalidKeyId { .. })));
}

#[tokio::test]
async fn test_empty_paths_rejected_before_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = unreachable_gpg(dir.path());

    let result = keyring.import_key(Path::new("")).await;
    assert!(matches!(result, Err(Error::InvalidPath { .. })));

    let result = keyring.verify_detached(Path::new("data"), Path::new("")).await;
    assert!(matches!(result, Err(Error::InvalidPath { .. })));

    let result = keyring.verify_inline(Path::new(""), Path::new("out")).await;
    assert!(matches!(result, Err(Error::InvalidPath { .. })));
}

#[tokio::test]
async fn test_missing_program_is_command_error() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = unreachable_gpg(dir.path());

    let result = keyring.fingerprint("DEADBEEF").await;
    assert!(matches!(result, Err(Error::Command(_))));
}

#[tokio::test]
async fn test_fingerprint_two_lines() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
[ "$5" = "--fingerprint" ] && [ "$6" = "0xABCD1234" ] || exit 9
echo "pub  1024D/ABCD1234 2001-01-01 Alice <a@example.com>"
echo "      Key fingerprint = 1111 2222 3333 4444 5555  6666 7777 8888 9999 AAAA"
echo "sub  2048g/EEEE0000 2001-01-01"
echo "      Key fingerprint = BBBB CCCC DDDD EEEE FFFF  0000 1111 2222 3333 4444"
"#,
    );

    let data = keyring.fingerprint("ABCD1234").await.unwrap();

    assert_eq!(
        data.fingerprints,
        [
            "1111 2222 3333 4444 5555  6666 7777 8888 9999 AAAA",
            "BBBB CCCC DDDD EEEE FFFF  0000 1111 2222 3333 4444"
        ]
    );
    assert_eq!(data.hex_ids, ["ABCD1234"]);
    assert!(data.owners.is_empty());
}

#[tokio::test]
async fn test_fingerprint_prefixed_id_strips_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"echo "      Key fingerprint = 1111 2222 3333 4444""#,
    );

    let data = keyring.fingerprint("0Xabcd1234").await.unwrap();
    assert_eq!(data.hex_ids, ["abcd1234"]);
}

#[tokio::test]
async fn test_fingerprint_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"echo "gpg: error reading key: No public key" >&2; exit 2"#,
    );

    let result = keyring.fingerprint("DEADBEEF").await;
    assert!(matches!(result, Err(Error::KeyNotFound(ref id)) if id == "0xDEADBEEF"));
}

#[tokio::test]
async fn test_fingerprint_missing_ring() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"echo "gpg: keybox '$2/pubring.kbx': No such file or directory" >&2; exit 2"#,
    );

    let result = keyring.fingerprint("DEADBEEF").await;
    assert!(matches!(result, Err(Error::KeyringNotInitialized)));
}

#[tokio::test]
async fn test_fingerprint_missing_ring_before_later_output() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
echo "gpg: keybox '$2/pubring.kbx': No such file or directory" >&2
i=0
while [ $i -lt 25 ]; do echo "gpg: note $i" >&2; i=$((i + 1)); done
exit 2
"#,
    );

    let result = keyring.fingerprint("DEADBEEF").await;
    assert!(matches!(result, Err(Error::KeyringNotInitialized)));
}

#[tokio::test]
async fn test_import_key() {
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("alice.asc");
    let keyring = keyring_with(
        dir.path(),
        r#"
[ "$7" = "--import" ] || exit 9
cat >&2 <<'EOF'
gpg: armor header: Version: GnuPG v1
:public key packet:
	version 4, algo 17, created 978307200, expires 0
	pkey[0]: [1024 bits]
:user ID packet: "Alice <a@example.com>"
gpg: key ABCD1234: public key "Alice <a@example.com>" imported
gpg: Total number processed: 1
gpg:               imported: 1
EOF
"#,
    );

    let data = keyring.import_key(&key_file).await.unwrap();

    assert_eq!(data.hex_ids, ["ABCD1234"]);
    assert_eq!(data.owners, ["Alice <a@example.com>"]);
    assert!(data.fingerprints.is_empty());
    assert_eq!(data.key_type.map(|k| k.to_string()), Some("dsa1024".to_string()));
    assert!(!data.is_signing_key);
}

#[tokio::test]
async fn test_import_marker_without_details() {
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("key.asc");
    let keyring = keyring_with(dir.path(), r#"echo "gpg:               imported: 1" >&2"#);

    let result = keyring.import_key(&key_file).await;
    assert!(matches!(result, Err(Error::ImportNotConfirmed(_))));

    keyring.add_key(&key_file).await.unwrap();
}

#[tokio::test]
async fn test_import_without_marker() {
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("key.asc");
    let keyring = keyring_with(
        dir.path(),
        r#"
echo 'gpg: key ABCD1234: "Alice <a@example.com>" not changed' >&2
echo "gpg:              unchanged: 1" >&2
"#,
    );

    let result = keyring.add_key(&key_file).await;
    match result {
        Err(Error::ImportNotConfirmed(reason)) => assert!(reason.contains("unchanged: 1")),
        other => panic!("expected ImportNotConfirmed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_import_failed_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("key.asc");
    let keyring = keyring_with(
        dir.path(),
        r#"echo "gpg:               imported: 1" >&2; exit 2"#,
    );

    let result = keyring.add_key(&key_file).await;
    assert!(matches!(result, Err(Error::Gpg { status: 2, .. })));
}

#[tokio::test]
async fn test_verify_detached_good_signature() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
[ "$5" = "--verify" ] && [ "$6" = "data.asc" ] && [ "$7" = "data" ] || exit 9
echo "gpg: Signature made Mon Jan  1 00:00:00 2001 UTC using DSA key ID DEADBEEF" >&2
echo 'gpg: Good signature from "Alice <a@example.com>"' >&2
"#,
    );

    let data = keyring
        .verify_detached(Path::new("data"), Path::new("data.asc"))
        .await
        .unwrap();
    assert_eq!(data.hex_ids, ["DEADBEEF"]);
}

#[tokio::test]
async fn test_verify_without_verdict_reports_signer() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
echo "gpg: Signature made Mon Jan  1 00:00:00 2001 UTC using DSA key ID DEADBEEF" >&2
echo "gpg: Can't check signature: public key not found" >&2
exit 2
"#,
    );

    let result = keyring
        .verify_detached(Path::new("data"), Path::new("data.asc"))
        .await;
    match result {
        Err(Error::UnverifiedSignature { signers }) => assert_eq!(signers, ["DEADBEEF"]),
        other => panic!("expected UnverifiedSignature, got {other:?}"),
    }
}

#[tokio::test]
async fn test_verify_bad_signature() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
echo "gpg: Signature made Mon Jan  1 00:00:00 2001 UTC using DSA key ID DEADBEEF" >&2
echo 'gpg: BAD signature from "Alice <a@example.com>"' >&2
exit 1
"#,
    );

    let result = keyring
        .verify_detached(Path::new("data"), Path::new("data.asc"))
        .await;
    match result {
        Err(Error::BadSignature { signers }) => assert_eq!(signers, ["DEADBEEF"]),
        other => panic!("expected BadSignature, got {other:?}"),
    }
}

#[tokio::test]
async fn test_verify_inline_good_signature() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
[ "$5" = "--output" ] && [ "$6" = "out.txt" ] && [ "$8" = "--decrypt" ] || exit 9
echo "gpg: Signature made Mon Jan  1 00:00:00 2001 UTC using DSA key ID DEADBEEF" >&2
echo 'gpg: Good signature from "Alice <a@example.com>"' >&2
"#,
    );

    let data = keyring
        .verify_inline(Path::new("in.asc"), Path::new("out.txt"))
        .await
        .unwrap();
    assert_eq!(data.hex_ids, ["DEADBEEF"]);
}

#[tokio::test]
async fn test_verify_inline_without_verdict_reports_signer() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
echo "gpg: Signature made Mon Jan  1 00:00:00 2001 UTC using DSA key ID DEADBEEF" >&2
exit 2
"#,
    );

    let result = keyring
        .verify_inline(Path::new("in.asc"), Path::new("out.txt"))
        .await;
    match result {
        Err(Error::UnverifiedSignature { signers }) => assert_eq!(signers, ["DEADBEEF"]),
        other => panic!("expected UnverifiedSignature, got {other:?}"),
    }
}

#[tokio::test]
async fn test_verify_good_signature_but_failed_exit() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
echo 'gpg: Good signature from "Alice <a@example.com>"' >&2
echo "gpg: can't create 'out.txt': Read-only file system" >&2
exit 2
"#,
    );

    let result = keyring
        .verify_inline(Path::new("in.asc"), Path::new("out.txt"))
        .await;
    assert!(matches!(result, Err(Error::Gpg { status: 2, .. })));
}

#[tokio::test]
async fn test_sign_detached_passes_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signature = dir.path().join("data.asc");
    let keyring = keyring_with(dir.path(), SIGN_SCRIPT);

    keyring
        .sign_detached("ABCD1234", "correct horse", &data, &signature)
        .await
        .unwrap();

    let written = std::fs::read_to_string(&signature).unwrap();
    assert_eq!(written, "correct horse");
}

#[tokio::test]
async fn test_sign_inline_passes_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signed = dir.path().join("data.signed");
    let keyring = keyring_with(
        dir.path(),
        r#"
out=""
clearsign=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output" ]; then out="$2"; fi
    if [ "$1" = "--clearsign" ]; then clearsign=yes; fi
    shift
done
[ -n "$clearsign" ] || exit 9
pass=$(cat)
printf '%s' "$pass" > "$out"
"#,
    );

    keyring
        .sign_inline("0xABCD1234", "correct horse", &data, &signed)
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&signed).unwrap(), "correct horse");
}

#[tokio::test]
async fn test_sign_passphrase_written_while_output_drains() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signature = dir.path().join("data.asc");
    let mut options = fake_gpg(
        r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output" ]; then out="$2"; fi
    shift
done
i=0
while [ $i -lt 3000 ]; do
    echo "gpg: progress $i ................................................" >&2
    i=$((i + 1))
done
cat | wc -c > "$out"
"#,
    );
    options.timeout_secs = Some(30);
    let keyring = Keyring::with_options(dir.path(), options);
    let passphrase = "x".repeat(200_000);

    keyring
        .sign_detached("ABCD1234", &passphrase, &data, &signature)
        .await
        .unwrap();

    let written = std::fs::read_to_string(&signature).unwrap();
    assert_eq!(written.trim(), "200000");
}

#[tokio::test]
async fn test_sign_detached_failure_removes_output() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signature = dir.path().join("data.asc");
    let keyring = keyring_with(dir.path(), FAILING_SIGN_SCRIPT);

    let result = keyring
        .sign_detached("ABCD1234", "wrong", &data, &signature)
        .await;

    assert!(matches!(result, Err(Error::Gpg { status: 2, .. })));
    assert!(!signature.exists(), "partial signature should be removed");
}

#[tokio::test]
async fn test_sign_inline_failure_removes_output() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signed = dir.path().join("data.signed");
    let keyring = keyring_with(dir.path(), FAILING_SIGN_SCRIPT);

    let result = keyring.sign_inline("0xABCD1234", "wrong", &data, &signed).await;

    assert!(result.is_err());
    assert!(!signed.exists());
}

#[tokio::test]
async fn test_sign_invalid_signer_leaves_output_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signature = dir.path().join("data.asc");
    std::fs::write(&signature, "existing").unwrap();
    let keyring = keyring_with(dir.path(), FAILING_SIGN_SCRIPT);

    let result = keyring
        .sign_detached("not-a-key", "pw", &data, &signature)
        .await;

    assert!(matches!(result, Err(Error::InvalidKeyId { .. })));
    assert_eq!(std::fs::read_to_string(&signature).unwrap(), "existing");
}

#[tokio::test]
async fn test_delete_key_twice() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("DEADBEEF.key"), "").unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
[ "$5" = "--delete-key" ] || exit 9
key="$2/${6#0x}.key"
if [ -e "$key" ]; then
    rm "$key"
else
    echo "gpg: key \"$6\" not found: Not found" >&2
    exit 2
fi
"#,
    );

    keyring.delete_key("DEADBEEF").await.unwrap();

    let result = keyring.delete_key("0xDEADBEEF").await;
    match result {
        Err(Error::Gpg { status, stderr }) => {
            assert_eq!(status, 2);
            assert!(stderr.contains("not found"));
        }
        other => panic!("expected Gpg error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_key_permission_denied_before_later_output() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
echo "gpg: can't create '$2/pubring.kbx.lock': Permission denied" >&2
i=0
while [ $i -lt 25 ]; do echo "gpg: note $i" >&2; i=$((i + 1)); done
exit 2
"#,
    );

    let result = keyring.delete_key("DEADBEEF").await;
    assert!(matches!(result, Err(Error::PermissionDenied)));
}

#[tokio::test]
async fn test_ring_mutations_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = keyring_with(
        dir.path(),
        r#"
mkdir "$2/busy" 2>/dev/null || exit 3
sleep 0.2
rmdir "$2/busy"
"#,
    );
    let other = keyring.clone();

    let (first, second) = tokio::join!(keyring.delete_key("AAAA1111"), other.delete_key("BBBB2222"));

    first.unwrap();
    second.unwrap();
}

#[tokio::test]
async fn test_timeout_kills_hung_gpg() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = fake_gpg("sleep 30");
    options.timeout_secs = Some(1);
    let keyring = Keyring::with_options(dir.path(), options);

    let started = std::time::Instant::now();
    let result = keyring.fingerprint("DEADBEEF").await;

    assert!(matches!(result, Err(Error::Timeout(1))));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_reaps_gpg_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = fake_gpg(r#"echo $$ > "$2/pid"; exec sleep 30"#);
    options.timeout_secs = Some(1);
    let keyring = Keyring::with_options(dir.path(), options);

    let result = keyring.fingerprint("DEADBEEF").await;
    assert!(matches!(result, Err(Error::Timeout(1))));

    let pid = std::fs::read_to_string(dir.path().join("pid")).unwrap();
    let proc_entry = Path::new("/proc").join(pid.trim());
    assert!(!proc_entry.exists(), "gpg should be killed and reaped");
}

#[tokio::test]
async fn test_timeout_during_sign_removes_output() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let signature = dir.path().join("data.asc");
    let mut options = fake_gpg(
        r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output" ]; then out="$2"; fi
    shift
done
echo partial > "$out"
sleep 30
"#,
    );
    options.timeout_secs = Some(1);
    let keyring = Keyring::with_options(dir.path(), options);

    let result = keyring.sign_detached("ABCD1234", "pw", &data, &signature).await;

    assert!(matches!(result, Err(Error::Timeout(1))));
    assert!(!signature.exists());
}

#[test]
fn test_with_homedir_returns_readonly_keyring() {
    let reader = Keyring::with_homedir("/tmp/test-ring");
    assert_eq!(reader.homedir(), Path::new("/tmp/test-ring"));
}

#[tokio::test]
#[ignore]
async fn test_fingerprint_real_gpg_empty_ring() {
    let dir = tempfile::tempdir().unwrap();
    let keyring = Keyring::new(dir.path());

    let result = keyring.fingerprint("DEADBEEF").await;
    assert!(result.is_err(), "an empty ring should not know any key");
}
