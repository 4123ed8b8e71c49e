use std::{env, fs};

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR")
        .expect("CARGO_MANIFEST_DIR was not defined, we need this to define C headers");

    println!("cargo::rerun-if-changed=bindgen.toml");
    println!("cargo::rerun-if-changed=src");

    let config = cbindgen::Config::from_file(format!("{crate_dir}/bindgen.toml"))
        .expect("Failed to read bindgen.toml (the bindgen config)");

    fs::create_dir_all(format!("{crate_dir}/include")).ok();

    cbindgen::Builder::new()
        .with_config(config)
        .with_crate(&crate_dir)
        .generate()
        .expect("Unable to generate bindings")
        .write_to_file(format!("{crate_dir}/include/kidneyos.h"));
}
