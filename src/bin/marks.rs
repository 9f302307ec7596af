use anyhow::Result;

fn main() -> Result<()> {
    rustmarks::cli::run()
}
