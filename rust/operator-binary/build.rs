//! Record build metadata (version, git revision, target) for the startup banner.

fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");
}
