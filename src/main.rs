use clap::Parser;
use clap_verbosity_flag::{ErrorLevel, Verbosity};
use env_logger::{Builder, Env};
use log::{error, info, LevelFilter};

use segcam::color_utils::{init_color_config, level_tag, Marker};
use segcam::config::{GlobalArgs, RunOptions, VisCommand};
use segcam::visualize::run;
use std::io::Write;

#[derive(Parser)]
#[command(name = "segcam", version)]
#[command(about = "GradCAM-family saliency visualizations for semantic segmentation models")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(flatten)]
    vis: VisCommand,
}

/// Default is WARN, each `-v` adds a level, and `-q` leaves only errors.
fn log_filter(verbosity: &Verbosity<ErrorLevel>) -> LevelFilter {
    if verbosity.is_silent() {
        return LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        LevelFilter::Off => LevelFilter::Off,
        LevelFilter::Error => LevelFilter::Warn,
        LevelFilter::Warn => LevelFilter::Info,
        LevelFilter::Info => LevelFilter::Debug,
        LevelFilter::Debug | LevelFilter::Trace => LevelFilter::Trace,
    }
}

fn main() {
    let cli = Cli::parse();

    init_color_config(cli.global.no_color);

    // If user didn't pass -v/-q and RUST_LOG is set, honor the env var.
    let use_env = !cli.global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(log_filter(&cli.global.verbosity));
        b
    };

    logger
        .format(|buf, record| {
            writeln!(buf, "[{}] {}", level_tag(record.level()), record.args())
        })
        .init();

    info!(
        "{}{} | cfg: {} | device: {}",
        Marker::Start.prefix(),
        cli.vis.vis_mode,
        cli.vis.cfg.display(),
        cli.global.device
    );

    let options = match RunOptions::from_args(&cli.global, cli.vis) {
        Ok(options) => options,
        Err(e) => {
            error!("{}{e}", Marker::Failed.prefix());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&options) {
        error!("{}Visualization failed: {e:#}", Marker::Failed.prefix());
        std::process::exit(1);
    }
}
