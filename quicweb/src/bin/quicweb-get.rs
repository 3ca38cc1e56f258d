//! Fetch one URL over HTTP/3 and print the response.
//!
//! Exits with status 1 if the request fails for any reason.

use std::process::ExitCode;

use clap::Parser;
use quicweb::config::GetArgs;
use quicweb::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = GetArgs::parse();
    logging::init(logging::DEFAULT_FILTER);

    let response = match quicweb::client::fetch(&args.url, &args.client_config()).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("quicweb-get: {}: {e}", args.url);
            return ExitCode::FAILURE;
        }
    };

    for field in &response.headers {
        println!(
            "{}: {}",
            String::from_utf8_lossy(&field.name),
            String::from_utf8_lossy(&field.value)
        );
    }
    println!();
    println!("{}", response.body_lossy());
    eprintln!(
        "{} bytes in {:.3} ms",
        response.body.len(),
        response.elapsed().as_secs_f64() * 1000.0
    );
    ExitCode::SUCCESS
}
