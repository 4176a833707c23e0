//! d20 headless driver.
//!
//! Loads an actor roster, invokes entities through the engine and prints
//! resolution bundles as JSON:
//!
//! ```bash
//! cargo run -p d20 -- --seed 42
//! cargo run -p d20 -- --roster party.json --config table.json --player Val
//! ```
//!
//! Logs go to stderr; set `RUST_LOG=d20_core=debug` to trace every phase.

mod headless;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = headless::parse_config_from_args(&args);
    headless::run_headless(config).await
}

fn print_help() {
    println!("d20 - headless action-resolution engine");
    println!();
    println!("USAGE:");
    println!("  d20 [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help          Show this help message");
    println!("  --roster <PATH>     Load actors from a roster save (default: sample party)");
    println!("  --config <PATH>     Load engine settings from a JSON file");
    println!("  --seed <N>          Roll dice from a fixed seed");
    println!("  --player <NAME>     Act as the player controlling actor NAME instead of the game master");
    println!();
    println!("Type #help once running for the command list.");
}
