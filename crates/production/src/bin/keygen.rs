//! Generate a validator's Merkle keyfile.
//!
//! # Usage
//!
//! ```bash
//! # Fresh random seed
//! tangle-keygen --output validator.key
//!
//! # Deterministic key from a 32-byte hex seed
//! tangle-keygen --seed 5e5e...5e --depth 10 --security 2 --output validator.key
//! ```
//!
//! The validator address (the Merkle root) is printed on stdout.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use tangle_types::merkle::MAX_DEPTH;
use tangle_types::winternitz::NUMBER_OF_SECURITY_LEVELS;
use tangle_types::MerkleKeyTree;

#[derive(Parser, Debug)]
#[command(name = "tangle-keygen")]
#[command(version, about = "Generate a validator Merkle keyfile", long_about = None)]
struct Cli {
    /// 32-byte seed as hex. A random seed is drawn when omitted.
    #[arg(long)]
    seed: Option<String>,

    /// Merkle tree depth; the key signs rounds `0..2^depth`
    #[arg(long, default_value_t = 10)]
    depth: usize,

    /// Signature fragments per milestone
    #[arg(long, default_value_t = 2)]
    security: usize,

    /// Where to write the keyfile
    #[arg(short, long)]
    output: PathBuf,
}

fn seed(cli: &Cli) -> Result<Vec<u8>> {
    match &cli.seed {
        Some(hex_seed) => {
            let seed = hex::decode(hex_seed).context("Seed is not valid hex")?;
            if seed.len() != 32 {
                bail!("Seed must be 32 bytes (64 hex chars), got {}", seed.len());
            }
            Ok(seed)
        }
        None => {
            let mut seed = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            Ok(seed)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.depth > MAX_DEPTH {
        bail!("Depth must not exceed {MAX_DEPTH}");
    }
    if !(1..=NUMBER_OF_SECURITY_LEVELS).contains(&cli.security) {
        bail!("Security must be between 1 and {NUMBER_OF_SECURITY_LEVELS}");
    }

    let seed = seed(&cli)?;
    let tree = MerkleKeyTree::generate(&seed, cli.depth, cli.security)
        .context("Key generation failed")?;
    fs::write(&cli.output, tree.to_keyfile_string())
        .with_context(|| format!("Failed to write keyfile: {}", cli.output.display()))?;

    // Just the address, for script consumption.
    println!("{}", tree.root().to_hex());
    Ok(())
}
