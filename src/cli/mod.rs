use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "telecam")]
#[command(about = "📷 Two-device camera/remote session layer", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run both roles in one process over the in-memory transport
    Demo {
        /// Seconds to run before shutting down
        #[arg(short, long, default_value_t = 10)]
        duration: u64,

        /// Raw frame interval in milliseconds
        #[arg(short, long, default_value_t = 150)]
        interval: u64,
    },

    /// Push one synthetic frame through the preview pipeline and save it
    Frame {
        /// Output path for the processed JPEG
        #[arg(short, long, default_value = "preview.jpg")]
        output: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
