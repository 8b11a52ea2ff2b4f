use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cfawalk::Config;

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let mut config = Config::default();
    if let Ok(max_frames) = std::env::var("CFAWALK_MAX_FRAMES") {
        config.max_frames = max_frames
            .parse()
            .expect("CFAWALK_MAX_FRAMES must be a number");
    }

    outer(config);
}

#[inline(never)]
fn outer(config: Config) {
    middle(config);
    std::hint::black_box(());
}

#[inline(never)]
fn middle(config: Config) {
    inner(config);
    std::hint::black_box(());
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline(never)]
fn inner(config: Config) {
    let mut index = 0;
    cfawalk::local::trace(config, |unwinder, frame| {
        let symbol = unwinder.symbol(frame).unwrap_or_else(|| "<unknown>".into());
        let fallback = if frame.return_address_fallback_used() { " (pc-1)" } else { "" };
        println!(
            "{index:>3}: {} cfa={}{fallback} {symbol}",
            frame.pc(),
            frame.cfa()
        );
        if frame.is_final() {
            println!("     native unwinding stops here");
        }
        index += 1;
        true
    });
    std::hint::black_box(());
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn inner(_config: Config) {
    eprintln!("walking the current process is only supported on x86-64 Linux");
}
