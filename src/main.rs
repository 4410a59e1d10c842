fn main() -> anyhow::Result<()> {
    cv_cli::run()
}
