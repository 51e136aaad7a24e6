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

pub mod asmfile;
pub mod codegen;
pub mod errors;
pub mod file_reader;
pub mod image;
pub mod linker;
pub mod object;
pub mod runtime;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::errors::CompileError;
use crate::file_reader::FileReader;
use crate::image::{Linkage, MethodDescriptor, ProgramImage};
use crate::linker::{LinkInput, Mirroring};

/// Name of the user method the runtime's reset routine jumps into once
/// hardware initialization finishes.
const ENTRY_METHOD: &str = "Main";

/// Compiles a `ProgramImage` plus zero or more external assembly files into
/// a complete `.nes` byte image (spec §1 "Purpose & scope"). `reader` loads
/// the named assembly files; `mirroring` selects the cartridge's nametable
/// mirroring flag (spec §6 "Output ROM" byte 6).
pub fn compile<F: FileReader>(
    image: &ProgramImage,
    asm_paths: &[impl AsRef<Path>],
    reader: &F,
    mirroring: Mirroring,
) -> Result<Vec<u8>> {
    let known_builtins = runtime::known_builtin_names();
    let read = image::read_program(image, &known_builtins).context("Failed during IL reading stage")?;

    if !read.methods.iter().any(|m| m.name == ENTRY_METHOD && matches!(m.linkage, Linkage::InternalUser)) {
        bail!("program image has no internal method named `{ENTRY_METHOD}`");
    }

    let methods_by_name: HashMap<String, &MethodDescriptor> =
        read.methods.iter().map(|m| (m.name.clone(), m)).collect();

    let mut codegen = codegen::CodeGenerator::new(&read.structs, &methods_by_name);
    let mut used_builtins = read.used_builtins.clone();
    let mut method_blocks = Vec::new();

    for desc in &read.methods {
        if !matches!(desc.linkage, Linkage::InternalUser) {
            continue;
        }
        let word_locals = image::word_locals(&desc.il);
        let block = codegen
            .compile_method(desc, &word_locals)
            .with_context(|| format!("Failed generating code for method `{}`", desc.name))?;
        method_blocks.push(block);
    }
    used_builtins.extend(codegen.used_builtins().iter().cloned());
    let data = codegen.into_data_tables();

    let mut asm_units = Vec::new();
    for path in asm_paths {
        let path = path.as_ref();
        let source = reader
            .read_to_string(path)
            .with_context(|| format!("Failed reading assembly file `{}`", path.display()))?;
        let file_name = path.to_string_lossy().to_string();
        let unit = asmfile::read_assembly(&file_name, &source)
            .with_context(|| format!("Failed parsing assembly file `{}`", path.display()))?;
        asm_units.push(unit);
    }

    // Block order (spec §4.5 "Layout"): reset/interrupt, runtime helpers,
    // user methods, then data tables. External-assembly blocks are spliced
    // in alongside user methods, since both are ordinary callable code.
    let mut blocks = Vec::new();
    blocks.extend(runtime::fixed_blocks(ENTRY_METHOD));
    blocks.extend(runtime::optional_blocks(&used_builtins));
    blocks.extend(method_blocks);
    for unit in &asm_units {
        blocks.extend(unit.blocks);
    }
    blocks.extend(data.ushort_tables);
    blocks.extend(data.byte_arrays);
    blocks.extend(data.strings);

    let chr_data = asm_units.into_iter().flat_map(|u| u.chr_data).collect();

    let rom = linker::link(LinkInput {
        blocks,
        nmi_label: "nmi".to_string(),
        reset_label: "reset".to_string(),
        irq_label: "reset".to_string(),
        chr_data,
        mirroring,
    })
    .context("Failed during linking stage")?;

    Ok(rom)
}

/// Convenience entry point matching the CLI's shape: reads the program
/// image JSON and every assembly file from disk via `reader`.
pub fn compile_from_paths<F: FileReader>(
    image_path: &Path,
    asm_paths: &[impl AsRef<Path>],
    reader: &F,
    mirroring: Mirroring,
) -> Result<Vec<u8>> {
    let image_text = reader
        .read_to_string(image_path)
        .with_context(|| format!("Failed reading program image `{}`", image_path.display()))?;
    let image: ProgramImage = serde_json::from_str(&image_text)
        .map_err(|e| CompileError::Malformed { reason: format!("invalid program image JSON: {e}") })
        .context("Failed parsing program image")?;
    compile(&image, asm_paths, reader, mirroring)
}
