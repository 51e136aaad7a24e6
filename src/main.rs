/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use cil2nes::file_reader::AsmFileReader;
use cil2nes::linker::Mirroring;
use std::fs;
use std::path::PathBuf;

#[derive(ClapParser)]
#[clap(version = "0.1.0", author = "Connor Nolan")]
struct Opts {
    /// Program image JSON produced by the IL-generating front end.
    #[clap(short, long)]
    image: PathBuf,

    /// External 6502 assembly files to link in alongside the generated code.
    #[clap(short, long)]
    asm: Vec<PathBuf>,

    /// Where to write the finished `.nes` ROM.
    #[clap(short, long)]
    output: PathBuf,

    /// Nametable mirroring wired on the cartridge.
    #[clap(long, value_enum, default_value = "horizontal")]
    mirroring: MirroringArg,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum MirroringArg {
    Horizontal,
    Vertical,
}

impl From<MirroringArg> for Mirroring {
    fn from(m: MirroringArg) -> Self {
        match m {
            MirroringArg::Horizontal => Mirroring::Horizontal,
            MirroringArg::Vertical => Mirroring::Vertical,
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let reader = AsmFileReader;

    let rom = cil2nes::compile_from_paths(&opts.image, &opts.asm, &reader, opts.mirroring.into())
        .context("Compilation failed")?;

    fs::write(&opts.output, &rom)
        .with_context(|| format!("Failed writing ROM to {}", opts.output.display()))?;

    println!("Wrote {} bytes to {}", rom.len(), opts.output.display());
    Ok(())
}
