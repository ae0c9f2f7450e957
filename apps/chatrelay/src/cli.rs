use clap::Parser;

/// Flags mirror `CHATRELAY_*` environment variables and win over them when
/// given; everything else about configuration stays in `GlobalConfig::from_env`.
#[derive(Parser)]
#[command(name = "chatrelay")]
pub(crate) struct Cli {
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,
    #[arg(long)]
    pub(crate) proxy: Option<String>,
}
