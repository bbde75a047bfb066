#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use stream_bench::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    simple_logger::init_with_level(log::Level::Info)?;
    stream_bench::run(config)
}
