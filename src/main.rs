fn main() {
    if let Err(err) = fogsync::run() {
        tracing::error!(error = %format!("{err:#}"), "fogsync failed");
        eprintln!("fogsync: {err:#}");
        std::process::exit(1);
    }
}
