// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use fsdump_core::{dump, Format};
use fsdump_device::Error;
use log::error;

/// Dumps a block device's filesystem-allocated regions into a sparse image.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Source device or image file to read.
    source: PathBuf,

    /// Destination sparse image to create.
    destination: PathBuf,

    /// Sparse-container format to write.
    #[arg(long, default_value_t = CliFormat::Sparseimage)]
    format: CliFormat,

    /// Enables verbose (trace-level) logging; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum CliFormat {
    Sparseimage,
    Vhdx,
}

impl std::fmt::Display for CliFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CliFormat::Sparseimage => "sparseimage",
            CliFormat::Vhdx => "vhdx",
        })
    }
}

impl From<CliFormat> for Format {
    fn from(format: CliFormat) -> Self {
        match format {
            CliFormat::Sparseimage => Format::SparseImage,
            CliFormat::Vhdx => Format::Vhdx,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match dump(&cli.source, &cli.destination, cli.format.into()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Maps the error taxonomy (spec.md §6) onto process exit codes: `EINVAL`
/// for argument/data problems, `ENOENT` when the source could not be
/// opened, and the propagated OS error code for everything else.
fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::InvalidArgument(_) | Error::InvalidData(_) | Error::NotSupported(_) | Error::PermissionDenied => 22, // EINVAL
        Error::Io(fsdump_device::IoError::Std(io_err)) => {
            if io_err.kind() == std::io::ErrorKind::NotFound {
                2 // ENOENT
            } else {
                io_err.raw_os_error().unwrap_or(1) as u8
            }
        }
        _ => 1,
    }
}
