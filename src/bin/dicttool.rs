use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use keydict::suggest::{SuggestionResults, MAX_RESULTS};
use keydict::{DictError, Dictionary, UnigramProperty};

#[derive(Parser)]
#[command(name = "dicttool", about = "Keydict dictionary inspection tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show header attributes and store counts
    Info {
        /// Dictionary file
        file: PathBuf,
    },
    /// Dump every word with its probability
    Dump {
        /// Dictionary file
        file: PathBuf,
        /// Emit JSON records instead of tab-separated lines
        #[arg(long)]
        json: bool,
    },
    /// Look up one word
    Lookup {
        /// Dictionary file
        file: PathBuf,
        /// Word to look up
        word: String,
    },
    /// Predict next words from a context word
    Predict {
        /// Dictionary file
        file: PathBuf,
        /// Previous word
        word: String,
    },
    /// Build a dictionary from "word<TAB>probability" lines
    Create {
        /// Input word list
        input: PathBuf,
        /// Output dictionary file
        output: PathBuf,
        /// Format version to write
        #[arg(long, default_value = "5")]
        format_version: u16,
        /// Locale recorded in the header
        #[arg(long, default_value = "en_US")]
        locale: String,
    },
    /// Rewrite a dictionary compactly
    Gc {
        /// Dictionary file
        file: PathBuf,
        /// Output path (defaults to rewriting in place)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Info { file } => info(&file),
        Command::Dump { file, json } => dump(&file, json),
        Command::Lookup { file, word } => lookup(&file, &word),
        Command::Predict { file, word } => predict(&file, &word),
        Command::Create {
            input,
            output,
            format_version,
            locale,
        } => create(&input, &output, format_version, &locale),
        Command::Gc { file, output } => gc(&file, output.as_deref()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dicttool: {e}");
            ExitCode::FAILURE
        }
    }
}

fn codepoints(word: &str) -> Vec<u32> {
    word.chars().map(|c| c as u32).collect()
}

fn info(file: &Path) -> Result<(), DictError> {
    let dict = Dictionary::open(file, false)?;
    println!("format version: {}", dict.format_version());
    println!("locale:         {}", dict.header().locale());
    for (key, value) in dict.header().attributes() {
        println!("attribute:      {key} = {value}");
    }
    println!("unigrams:       {}", dict.get_property("UNIGRAM_COUNT", 32));
    println!("bigrams:        {}", dict.get_property("BIGRAM_COUNT", 32));
    println!("corrupted:      {}", dict.is_corrupted());
    Ok(())
}

fn dump(file: &Path, json: bool) -> Result<(), DictError> {
    let dict = Dictionary::open(file, false)?;
    let mut token = 0u64;
    loop {
        let (word, next_token) = dict.get_next_word_and_next_token(token);
        let Some(word) = word else {
            break;
        };
        let probability = dict.get_probability(&word);
        let text = Dictionary::word_to_string(&word);
        if json {
            let property = dict.get_word_property(&word);
            let bigrams: Vec<serde_json::Value> = property
                .map(|p| {
                    p.bigrams
                        .iter()
                        .map(|b| {
                            serde_json::json!({
                                "target": Dictionary::word_to_string(&b.target_codepoints),
                                "probability": b.probability,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            println!(
                "{}",
                serde_json::json!({
                    "word": text,
                    "probability": probability,
                    "bigrams": bigrams,
                })
            );
        } else {
            println!("{text}\t{probability}");
        }
        if next_token == 0 {
            break;
        }
        token = next_token;
    }
    Ok(())
}

fn lookup(file: &Path, word: &str) -> Result<(), DictError> {
    let dict = Dictionary::open(file, false)?;
    let cps = codepoints(word);
    let probability = dict.get_probability(&cps);
    println!("probability: {probability}");
    if let Some(property) = dict.get_word_property(&cps) {
        println!(
            "flags: not_a_word={} blacklisted={}",
            property.unigram.is_not_a_word, property.unigram.is_blacklisted
        );
        for shortcut in property.shortcuts() {
            println!(
                "shortcut: {} ({})",
                Dictionary::word_to_string(&shortcut.target_codepoints),
                shortcut.probability
            );
        }
        for bigram in &property.bigrams {
            println!(
                "bigram: {} ({})",
                Dictionary::word_to_string(&bigram.target_codepoints),
                bigram.probability
            );
        }
    }
    Ok(())
}

fn predict(file: &Path, word: &str) -> Result<(), DictError> {
    let dict = Dictionary::open(file, false)?;
    let mut results = SuggestionResults::new(MAX_RESULTS);
    dict.get_predictions(&codepoints(word), &mut results);
    for suggested in results.into_sorted_vec() {
        println!(
            "{}\t{}",
            Dictionary::word_to_string(&suggested.codepoints),
            suggested.score
        );
    }
    Ok(())
}

fn create(
    input: &Path,
    output: &Path,
    format_version: u16,
    locale: &str,
) -> Result<(), DictError> {
    let text = std::fs::read_to_string(input)?;
    let mut dict = Dictionary::create_on_memory(format_version, locale, &[])?;
    let mut added = 0usize;
    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (word, probability) = match line.split_once('\t') {
            Some((w, p)) => (w, p.trim().parse::<u8>().unwrap_or(1)),
            None => (line, 1),
        };
        if !dict.add_unigram_word(&codepoints(word), &UnigramProperty::new(probability)) {
            eprintln!("line {}: cannot add {word:?}", line_number + 1);
        } else {
            added += 1;
        }
    }
    dict.flush_with_gc(output)?;
    println!("wrote {added} words to {}", output.display());
    Ok(())
}

fn gc(file: &Path, output: Option<&Path>) -> Result<(), DictError> {
    let mut dict = Dictionary::open(file, true)?;
    let target = output.unwrap_or(file);
    dict.flush_with_gc(target)?;
    println!(
        "compacted {} words, {} bigrams into {}",
        dict.get_property("UNIGRAM_COUNT", 32),
        dict.get_property("BIGRAM_COUNT", 32),
        target.display()
    );
    Ok(())
}
