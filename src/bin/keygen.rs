//! Ed25519 identity generator for swarmrelay agents.
//!
//! Generates a keypair, writes it as `{pubkey, privkey}` JSON (mode 0600
//! on Unix) via `crypto::save_identity`, and prints the pubkey/stable id
//! an operator needs to register the agent (allowlist entry, hardcoded
//! peer config, etc).
//!
//! Usage:
//!   cargo run --bin swarmrelay-keygen -- --output ./identity.json

use clap::Parser;
use std::path::PathBuf;
use swarmrelay::crypto::Keypair;

#[derive(Parser)]
#[command(name = "swarmrelay-keygen", version, about = "Generate an Ed25519 agent identity")]
struct Args {
    /// Output path for the identity file.
    #[arg(short, long, default_value = "identity.json")]
    output: PathBuf,

    /// Refuse to overwrite an existing file.
    #[arg(long)]
    no_clobber: bool,
}

fn main() {
    let args = Args::parse();

    if args.no_clobber && args.output.exists() {
        eprintln!("refusing to overwrite existing identity file: {}", args.output.display());
        std::process::exit(1);
    }

    let keypair = Keypair::generate();

    if let Err(e) = swarmrelay::crypto::save_identity(&args.output, &keypair) {
        eprintln!("failed to write identity file: {e}");
        std::process::exit(1);
    }

    println!("identity written to {}", args.output.display());
    println!("pubkey:    {}", keypair.public_key_hex());
    println!("stable id: {}", keypair.stable_id());
    println!();
    println!("to allowlist this agent, add the pubkey above to the allowlist JSON array.");
}
