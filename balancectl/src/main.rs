use clap::Parser;

fn main() {
    let cli = balancectl::Cli::parse();
    balancectl::init_tracing(&cli.log_level);
    if let Err(err) = balancectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
