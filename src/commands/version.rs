use anyhow::Result;

pub fn run() -> Result<()> {
    println!("kube-rightsizer v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
