//! Example: Print the fingerprints of a key in a gpg home directory
//!
//! Run with: cargo run --example fingerprint -- ~/.gnupg DEADBEEF

use gpg_ring::Keyring;

#[tokio::main]
async fn main() -> gpg_ring::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(homedir), Some(hex_id)) = (args.next(), args.next()) else {
        eprintln!("usage: fingerprint <gpg homedir> <key id>");
        std::process::exit(2);
    };

    let reader = Keyring::with_homedir(homedir);
    let data = reader.fingerprint(&hex_id).await?;

    println!("{}", format_key_output(&data));

    Ok(())
}

fn format_key_output(data: &gpg_ring::KeyData) -> String {
    let key_id = data.hex_ids.first().map(String::as_str).unwrap_or("?");

    let mut out = format!("key {key_id}");
    for (i, fingerprint) in data.fingerprints.iter().enumerate() {
        let label = if i == 0 { "primary" } else { "subkey " };
        out.push_str(&format!("\n    {label} {fingerprint}"));
    }
    out
}
