use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=SNF_LIB_DIR");
    if env::var_os("CARGO_FEATURE_SNF").is_none() {
        return;
    }
    let dir = env::var("SNF_LIB_DIR").unwrap_or_else(|_| "/opt/snf/lib".to_string());
    println!("cargo:rustc-link-search=native={dir}");
}
