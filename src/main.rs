fn main() -> anyhow::Result<()> {
    diary_drafts::cli::run()
}
