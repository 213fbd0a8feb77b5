fn main() {
    // Gather build-time information for the binary's version output.
    println!("cargo:rerun-if-changed=build.rs");
    built::write_built_file().expect("Failed to acquire build-time information");
}
