//! Terminal and JSON output for bramble commands.
//!
//! Status lines go to stdout except errors, which go to stderr. With
//! `--output json` commands print a single JSON document instead.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

#[derive(Clone, Copy)]
enum Tone {
  Success,
  Info,
  Failure,
}

impl Tone {
  fn stream(self) -> Stream {
    match self {
      Tone::Failure => Stream::Stderr,
      _ => Stream::Stdout,
    }
  }

  fn marker(self) -> String {
    let stream = self.stream();
    match self {
      Tone::Success => "✓".if_supports_color(stream, |s| s.green()).to_string(),
      Tone::Info => "•".if_supports_color(stream, |s| s.blue()).to_string(),
      Tone::Failure => "✗".if_supports_color(stream, |s| s.red()).to_string(),
    }
  }
}

fn status(tone: Tone, message: &str) {
  let marker = tone.marker();
  match tone {
    Tone::Failure => eprintln!("{marker} {}", message.if_supports_color(Stream::Stderr, |s| s.red())),
    _ => println!("{marker} {message}"),
  }
}

pub fn print_success(message: &str) {
  status(Tone::Success, message);
}

pub fn print_info(message: &str) {
  status(Tone::Info, message);
}

pub fn print_error(message: &str) {
  status(Tone::Failure, message);
}

/// An indented `label: value` line under the last status line.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize output as JSON")?;
  println!("{json}");
  Ok(())
}

/// Derivation filenames and hashes cut to 12 characters.
pub fn truncate_hash(hash: &str) -> &str {
  match hash.char_indices().nth(12) {
    Some((i, _)) => &hash[..i],
    None => hash,
  }
}

/// Elapsed time at millisecond precision, e.g. `1m 5s 20ms`.
pub fn format_duration(duration: Duration) -> String {
  let millis = Duration::from_millis(duration.as_millis().try_into().unwrap_or(u64::MAX));
  humantime::format_duration(millis).to_string()
}
