use clap::Parser;
use cleaver::Args;

// --------------------------------------------------
fn main() {
    if let Err(e) = cleaver::run(Args::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
