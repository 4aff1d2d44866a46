//! Implementation of the `bramble show` command.
//!
//! Prints each derivation's canonical JSON along with the hash and filename
//! it would be stored under. Nothing is built and the store isn't opened.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use bramble_lib::derivation::Derivation;

use super::read_derivations;
use crate::output::{OutputFormat, print_info, print_json, print_stat};

#[derive(Serialize)]
struct Shown {
  filename: String,
  hash: String,
  derivation: Derivation,
}

pub fn cmd_show(file: &Path, output: OutputFormat) -> Result<()> {
  let shown: Vec<Shown> = read_derivations(file)?
    .into_iter()
    .map(|drv| Shown {
      filename: drv.filename(),
      hash: drv.hash(),
      derivation: drv,
    })
    .collect();

  if output.is_json() {
    return print_json(&shown);
  }

  for (i, item) in shown.iter().enumerate() {
    if i > 0 {
      println!();
    }
    print_info(&item.derivation.name);
    print_stat("Filename", &item.filename);
    print_stat("Hash", &item.hash);
    println!("{}", item.derivation.to_pretty_json());
  }
  Ok(())
}
