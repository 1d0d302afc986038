/// CLI for the inbox daemon
fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    inbox_core::cli_app::run(args)
}
