// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! `savanna` binary subcommands.

use crate::index::Network;
use crate::ingest::{self, IngestOptions, IngestReceipt};
use crate::node::Kind;
use crate::util::CancelToken;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

/// Offline indexer for Solana epoch CAR archives.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build all four indexes from an epoch CAR in one pass.
    IndexAll {
        /// Path to the epoch CAR file.
        car_path: PathBuf,
        /// Directory the sealed indexes are written to.
        index_dir: PathBuf,
        /// Scratch directory for builder spill files. Defaults to the
        /// index directory.
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
        /// Network the epoch belongs to.
        #[arg(long, value_enum, default_value_t)]
        network: Network,
        /// Re-stream the CAR after sealing and prove every index entry
        /// against it.
        #[arg(long)]
        verify: bool,
    },
    /// Check previously sealed indexes against their CAR.
    Verify {
        car_path: PathBuf,
        index_dir: PathBuf,
    },
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let cancel = CancelToken::new();
        match self.cmd {
            Command::IndexAll {
                car_path,
                index_dir,
                tmp_dir,
                network,
                verify,
            } => {
                anyhow::ensure!(car_path.is_file(), "CAR not found: {}", car_path.display());
                std::fs::create_dir_all(&index_dir)?;
                let tmp_dir = tmp_dir.unwrap_or_else(|| index_dir.clone());
                std::fs::create_dir_all(&tmp_dir)?;

                let receipt = ingest::build_all_indexes(
                    &car_path,
                    &IngestOptions {
                        network,
                        index_dir: index_dir.clone(),
                        tmp_dir,
                        reader: Default::default(),
                        progress: true,
                    },
                    &cancel,
                )?;
                print_receipt(&receipt);

                if verify {
                    ingest::verify_indexes(&car_path, &index_dir, &cancel)?;
                    info!("verification passed");
                }
                Ok(())
            }
            Command::Verify {
                car_path,
                index_dir,
            } => {
                anyhow::ensure!(car_path.is_file(), "CAR not found: {}", car_path.display());
                ingest::verify_indexes(&car_path, &index_dir, &cancel)?;
                info!("verification passed");
                Ok(())
            }
        }
    }
}

fn print_receipt(receipt: &IngestReceipt) {
    println!("epoch {} (root {})", receipt.epoch, receipt.root);
    println!(
        "indexed {} nodes: {} blocks, {} entries, {} transactions, {} dataframes, {} rewards",
        receipt.counts.total(),
        receipt.counts.of(Kind::Block),
        receipt.counts.of(Kind::Entry),
        receipt.counts.of(Kind::Transaction),
        receipt.counts.of(Kind::DataFrame),
        receipt.counts.of(Kind::Rewards),
    );
    for path in [
        &receipt.sealed.cid_to_offset_and_size,
        &receipt.sealed.slot_to_cid,
        &receipt.sealed.sig_to_cid,
        &receipt.sealed.sig_exists,
    ] {
        println!("sealed {}", path.display());
    }
}
