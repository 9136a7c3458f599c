//! # mqtt-bridge CLI
//!
//! Command-line utilities for inspecting topics and payloads.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mqtt_bridge_core::codec::CodecKind;
use mqtt_bridge_core::{CodecPair, Message, MessageType, PrivatePathExtractor};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "resolve" => {
            if args.len() < 4 {
                eprintln!("Usage: mqtt-bridge resolve <prefix> <topic>");
                std::process::exit(1);
            }
            let extractor = PrivatePathExtractor::new(&args[2]);
            println!("{}", extractor.resolve(&args[3]));
        }
        "encode" => {
            if args.len() < 4 {
                eprintln!("Usage: mqtt-bridge encode <codec> <json>");
                std::process::exit(1);
            }
            let codecs = codec_pair(&args[2])?;
            let message: Message = serde_json::from_str(&args[3]).context("Invalid JSON message")?;
            let payload = codecs.serialize(&message).context("Failed to encode")?;
            println!("{}", STANDARD.encode(payload));
        }
        "decode" => {
            if args.len() < 4 {
                eprintln!("Usage: mqtt-bridge decode <codec> <base64>");
                std::process::exit(1);
            }
            let codecs = codec_pair(&args[2])?;
            let payload = STANDARD
                .decode(args[3].trim())
                .context("Invalid base64 payload")?;
            let message = codecs.deserialize(&payload).context("Failed to decode")?;
            println!("{message}");
        }
        "codecs" => {
            for kind in CodecKind::ALL {
                println!("{kind}");
            }
        }
        "types" => {
            for message_type in MessageType::ALL {
                println!("{message_type}");
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Both directions of one registered codec.
fn codec_pair(name: &str) -> Result<CodecPair> {
    let module = name.split_once(':').map_or(name, |(module, _)| module);
    CodecPair::resolve(&module.into(), &module.into())
        .with_context(|| format!("Unknown codec {name:?}"))
}

fn print_help() {
    println!(
        r#"mqtt-bridge CLI

USAGE:
    mqtt-bridge <COMMAND> [OPTIONS]

COMMANDS:
    resolve <prefix> <topic>  Resolve a private (~) topic under a prefix
    encode <codec> <json>     Encode a JSON message, print it as base64
    decode <codec> <base64>   Decode a base64 payload, print it as JSON
    codecs                    List registered codecs
    types                     List supported message types
    help                      Show this help message

EXAMPLES:
    mqtt-bridge resolve robot1 "~state"
    mqtt-bridge encode msgpack '{{"data": "ok"}}'
    mqtt-bridge decode msgpack gaRkYXRhom9r
"#
    );
}
