extern crate kafka_compression_bench;

use clap::Parser;
use kafka_compression_bench::{publish_file, Compression, KafkaConfig, SourceOptions};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kafka broker server in the host:port form
    #[arg(short, long)]
    bootstrap_server: String,

    /// CSV file with a header row
    #[arg(short, long)]
    file: PathBuf,

    /// Compression codec: none, gzip, snappy, lz4 or zstd
    #[arg(short, long, default_value_t = Compression::Lz4)]
    compression: Compression,

    /// Kafka topic to produce onto, derived from the codec if omitted
    #[arg(short, long)]
    topic: Option<String>,

    /// Publish numeric looking values as JSON numbers
    #[arg(long)]
    infer_types: bool,

    /// Field delimiter of the input file
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Extra producer properties in the key=value form
    #[arg(short = 'X', value_parser = parse_key_val)]
    producer_params: Vec<(String, String)>,

    /// Seconds to wait for the broker when creating the producer, 0 to skip
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value: no `=` found in `{s}`"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Zero disables the broker check at startup.
fn connect_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if !args.delimiter.is_ascii() {
        eprintln!("Error: delimiter must be a single ASCII character");
        process::exit(2);
    }

    let kafka_config = KafkaConfig::new_producer_config(args.bootstrap_server.as_str(), None)
        .with_compression(args.compression)
        .with_overrides(args.producer_params)
        .with_connect_timeout(connect_timeout(args.connect_timeout));

    let source_options = SourceOptions {
        delimiter: args.delimiter as u8,
        infer_types: args.infer_types,
        ..Default::default()
    };
    let topic = args
        .topic
        .unwrap_or_else(|| args.compression.default_topic());

    match publish_file(&args.file, &source_options, kafka_config, &topic) {
        Ok(stats) if args.json => println!("{}", stats.to_json()),
        Ok(stats) => println!("{stats}"),
        Err(err) => {
            eprintln!("Error: {err:?}");
            process::exit(1);
        }
    }
}
