use cairn_context::text::{DEFAULT_MAX_CHUNK_SIZE, DEFAULT_OVERLAP_SIZE, TextChunker};
use cairn_context::tokens::estimate_tokens;
use clap::Parser;
use serde::Serialize;
use std::fs;
use std::io::{self, Read};

/// A CLI tool to chunk text files into JSON output using cairn-context.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// File path recorded in the output.
    #[arg(short, long, default_value = "unknown_path")]
    path: String,

    /// Maximum length of each chunk in characters.
    #[arg(short, long, default_value_t = DEFAULT_MAX_CHUNK_SIZE)]
    max_chunk_size: usize,

    /// Characters carried over from one chunk into the next.
    #[arg(short, long, default_value_t = DEFAULT_OVERLAP_SIZE)]
    overlap: usize,
}

#[derive(Serialize)]
struct SerializableChunk<'a> {
    path: &'a str,
    sequence: usize,
    estimated_tokens: usize,
    text: String,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let chunker = TextChunker::new(args.max_chunk_size, args.overlap);
    let chunks: Vec<SerializableChunk> = chunker
        .get_chunks(&file_content)
        .into_iter()
        .map(|c| SerializableChunk {
            path: &args.path,
            sequence: c.sequence,
            estimated_tokens: estimate_tokens(&c.text),
            text: c.text,
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&chunks)?;
    println!("{json_output}");

    Ok(())
}
