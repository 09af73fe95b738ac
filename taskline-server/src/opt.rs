use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "taskline-server", about = "Taskline chat service")]
pub struct Opt {
    /// Config file path
    #[arg(short, long, value_parser, default_value = "config.toml")]
    pub config: clio::Input,
}
