//! Emits a `gitver_hashes.rs` file into `OUT_DIR` that embeds a [`GitverHashes`] snapshot taken
//! at build time, along with `get()` and `print_all()` accessors for the compiled binary.

use crate::GitverHashes;
use std::{env, fs, path::PathBuf};

pub fn write_mod(hashes: GitverHashes) {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let dest = out_dir.join("gitver_hashes.rs");

    let encoded = ron::to_string(&hashes).expect("failed to serialize GitverHashes");

    let body = format!(
        "static GITVER_HASHES: std::sync::OnceLock<gitver::GitverHashes> = std::sync::OnceLock::new();\n\
         \n\
         /// The [`gitver::GitverHashes`] snapshot captured at build time.\n\
         pub fn get() -> &'static gitver::GitverHashes {{\n    \
             GITVER_HASHES.get_or_init(|| ron::from_str({encoded:?}).expect(\"embedded gitver hashes are malformed\"))\n\
         }}\n\
         \n\
         /// Print the build-time git provenance hashes to stdout.\n\
         pub fn print_all() {{\n    \
             println!(\"{{}}\", get());\n\
         }}\n"
    );

    fs::write(&dest, body).unwrap_or_else(|e| panic!("failed to write {}: {e}", dest.display()));
}
