pub fn run() -> anyhow::Result<()> {
    println!("llmsafespace {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
