fn main() {
    // The compiled-in default backend URL is read with `option_env!`.
    println!("cargo:rerun-if-env-changed=BEACON_BACKEND_URL");
}
