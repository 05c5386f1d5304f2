use std::path::PathBuf;

use clap::Parser;

/// Records ray dispatches of a SPIR-V pipeline into a storage buffer,
/// without a window.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Raygen shader. Writes one u32 per pixel to the buffer at set 0, binding 0
    #[clap(long, value_parser)]
    pub rgen: PathBuf,

    /// Miss shader
    #[clap(long, value_parser)]
    pub rmiss: PathBuf,

    /// Closest hit shader
    #[clap(long, value_parser)]
    pub rchit: Option<PathBuf>,

    #[clap(short = 'W', long, value_parser, default_value_t = 256)]
    pub width: u32,

    #[clap(short = 'H', long, value_parser, default_value_t = 256)]
    pub height: u32,

    /// Number of dispatches to record and submit
    #[clap(short, long, value_parser, default_value_t = 8)]
    pub frames: u32,

    #[clap(long, value_parser, default_value_t = 2)]
    pub frames_in_flight: usize,

    #[clap(long, value_parser, default_value_t = 1)]
    pub max_recursion_depth: u32,
}
