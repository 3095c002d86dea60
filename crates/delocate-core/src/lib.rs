//! Make macOS Python packages self-contained.
//!
//! This crate provides functionality to:
//!
//! 1. Parse Mach-O binaries (thin and fat) and extract dependency information.
//! 2. Resolve the transitive library dependencies of a package.
//! 3. Copy external libraries into the package, deduplicated by real path.
//! 4. Rewrite install names to relative paths (`@loader_path`) and re-sign modified binaries.
//! 5. Fuse packages built for different architectures into universal binaries.
//!
//! This library is derived from [`delocate`](https://github.com/matthew-brett/delocate) by Matthew
//! Brett and contributors, which is available under the following BSD-2-Clause license:
//!
//! ```text
//! Copyright (c) 2014-2025, Matthew Brett and the Delocate contributors.
//! All rights reserved.
//!
//! Redistribution and use in source and binary forms, with or without
//! modification, are permitted provided that the following conditions are met:
//!
//! 1. Redistributions of source code must retain the above copyright notice, this
//!    list of conditions and the following disclaimer.
//!
//! 2. Redistributions in binary form must reproduce the above copyright notice,
//!    this list of conditions and the following disclaimer in the documentation
//!    and/or other materials provided with the distribution.
//!
//! THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
//! AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
//! IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//! DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
//! FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
//! DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//! SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
//! CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
//! OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
//! OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//! ```

pub mod codesign;
pub mod copy;
mod delocate;
mod error;
pub mod fat;
pub mod fuse;
pub mod macho;
mod package;
pub mod patch;
pub mod resolve;
pub mod wheel;
mod writer;

pub use codesign::{AdhocSigner, CodeSigner, CodesignTool, SignerKind};
pub use delocate::{
    DelocateOptions, DelocateReport, DelocatedWheel, delocate_package, delocate_tree,
    delocate_wheel, list_dependencies, update_platform_tags,
};
pub use error::{DelocateError, PatchError};
pub use macho::{MachOFile, is_macho_file, parse_macho};
pub use package::{Package, find_binaries};
pub use patch::{BinaryEdits, patch_binary};
pub use resolve::{DependencyClass, DependencyGraph, ExclusionPolicy, ExclusionRule};
