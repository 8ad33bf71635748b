use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "flycast-server",
    version,
    about = "Flyability forecast notification service"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8090)]
    pub port: u16,
    /// Run the full ingest pipeline once and exit instead of starting the scheduler.
    #[arg(long, default_value_t = false)]
    pub run_once: bool,
}
