use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// Path to the JSON configuration file
    pub config: PathBuf,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}
