use clap::Parser;
use ragline_context::{RecursiveSplitter, SplitterConfig, normalize_text};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};

/// Preview how ragline normalizes and chunks a text file. Prints JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Source path to report in the output.
    #[arg(short, long, default_value = "stdin")]
    path: String,

    /// Maximum chunk length in characters.
    #[arg(short = 's', long, default_value_t = ragline_context::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Characters carried over between consecutive chunks.
    #[arg(short = 'o', long, default_value_t = ragline_context::DEFAULT_CHUNK_OVERLAP)]
    chunk_overlap: usize,

    /// Skip whitespace normalization.
    #[arg(long)]
    raw: bool,
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    path: &'a str,
    sequence: usize,
    char_len: usize,
    text: &'a str,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = &args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let splitter = RecursiveSplitter::new(SplitterConfig {
        chunk_size: args.chunk_size,
        chunk_overlap: args.chunk_overlap,
        ..SplitterConfig::default()
    })
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let text = if args.raw {
        file_content
    } else {
        normalize_text(&file_content)
    };
    let chunks = splitter.chunks(&text);

    let output: Vec<ChunkOutput> = chunks
        .iter()
        .map(|c| ChunkOutput {
            path: &args.path,
            sequence: c.sequence,
            char_len: c.char_len,
            text: &c.text,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
