use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=ASCEND_TOOLKIT_HOME");

    // The ACL runtime is only linked when the `acl` feature is enabled;
    // everything else in the crate is driver-free and must build on
    // machines without the toolkit installed.
    if env::var("CARGO_FEATURE_ACL").is_err() {
        return;
    }

    let toolkit = env::var("ASCEND_TOOLKIT_HOME")
        .unwrap_or_else(|_| "/usr/local/Ascend/ascend-toolkit/latest".to_string());
    println!("cargo:rustc-link-search=native={}/lib64", toolkit);
    println!("cargo:rustc-link-search=native={}/runtime/lib64", toolkit);
    println!("cargo:rustc-link-lib=dylib=ascendcl");
}
