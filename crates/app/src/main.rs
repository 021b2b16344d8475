mod cli;
mod counter;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    cli::handle_commands(std::env::args_os())
}
