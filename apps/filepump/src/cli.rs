use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "filepump", version, about = "Chunked file transfer server and client")]
pub struct Cli {
    /// TOML config file (default: ./filepump.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address for client commands
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Bearer token
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve a directory
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
        /// Directory to serve and store uploads in
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },
    /// List the files a server offers
    List,
    /// Download a file
    Download {
        name: String,
        /// Output path (default: the file name)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Upload a file
    Upload {
        path: PathBuf,
        /// Name to store it under; without one the server only counts bytes
        #[arg(long)]
        name: Option<String>,
    },
    /// Upload a file and print the server's progress notes
    UploadProgress {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Print a fresh random token
    Token,
}

impl Cli {
    /// Applies command-line overrides on top of the file config.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(server) = &self.server {
            config.server_address = server.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Command::Serve { bind, storage_dir } = &self.command {
            if let Some(bind) = bind {
                config.bind_address = bind.clone();
            }
            if let Some(dir) = storage_dir {
                config.storage_dir = dir.clone();
            }
        }
    }
}
