//! Decode and print a persisted `.topology` file.
//!
//! Operator tool for inspecting a node's data directory:
//!
//! ```text
//! topology-inspect /var/lib/tessera/.topology
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use tessera_server::cluster::topology;

#[derive(Parser)]
#[command(name = "topology-inspect", about = "Print a persisted tessera topology file")]
struct Args {
    /// Path to a `.topology` file (or a data directory containing one).
    #[arg(env = "TESSERA_TOPOLOGY")]
    path: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let path = if args.path.is_dir() {
        args.path.join(topology::TOPOLOGY_FILE)
    } else {
        args.path
    };

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("reading {}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    };
    match topology::decode(&bytes) {
        Ok((cluster_id, ids)) => {
            println!("cluster-id: {cluster_id}");
            println!("nodes: {}", ids.len());
            for id in ids {
                println!("  {id}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("decoding {}: {err}", path.display());
            ExitCode::FAILURE
        }
    }
}
