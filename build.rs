fn main() {
    // Base URL baked in as the default for the API client
    const FALLBACK_API_URL: &str = "https://api.example.com";

    let api_url = match std::env::var("CHATEM_DEFAULT_API_URL") {
        Ok(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
        _ => FALLBACK_API_URL.to_string(),
    };

    println!("cargo:rustc-env=CHATEM_DEFAULT_API_URL={}", api_url);

    // Re-run build script if CHATEM_DEFAULT_API_URL changes
    println!("cargo:rerun-if-env-changed=CHATEM_DEFAULT_API_URL");
}
