mod cli;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    app::pipeline::telemetry::init_tracing(args.iter().any(|a| a == "--verbose"));
    if cli::handle_commands(&args)? {
        return Ok(());
    }

    cli::print_usage();
    Ok(())
}
