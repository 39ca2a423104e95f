#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod domain;
pub mod enrichment;
pub mod errors;
pub mod lotmatch;
pub mod process;
pub mod providers;
pub mod runner;
pub mod staging;
pub mod util;

pub mod gitver_hashes {
    include!(concat!(env!("OUT_DIR"), "/gitver_hashes.rs"));

    #[cfg(test)]
    mod tests {
        use super::*;
        use tracing_test::traced_test;

        #[test]
        #[traced_test]
        fn print_gitvers() {
            let _ = tracing_log::LogTracer::init();

            // try: cargo test -- --nocapture
            print_all();
        }
    }
}
