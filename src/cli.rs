use clap::{Parser, Subcommand};
use halcon_license_updater::config::DEFAULT_CONFIG_FILE;
use halcon_license_updater::UpdateInterval;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download this month's license files and offer to install them
    Check {
        /// Install without asking when at least one file was downloaded
        #[arg(short, long)]
        yes: bool,
    },

    /// Download this month's license files only
    Download,

    /// Install already downloaded license files for this month
    Install,

    /// Run unattended, checking on a timer until interrupted
    Serve {
        /// Check interval (defaults to the configured one)
        #[arg(short, long, value_enum)]
        interval: Option<UpdateInterval>,

        /// Run even if automatic updates are disabled in the settings
        #[arg(long)]
        force: bool,

        /// Run one check right away instead of waiting for the first tick
        #[arg(long)]
        now: bool,
    },

    /// Show or edit the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the current settings
    Show,

    /// Set one value; KEY may be nested with ':' and VALUE is JSON or a plain string
    Set { key: String, value: String },

    /// List relays in the order they are tried
    Relays,
}
