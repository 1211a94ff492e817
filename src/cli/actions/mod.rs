pub mod run;

use crate::emitter::SinkKind;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        listen: Option<String>,
        config: PathBuf,
        sink: SinkKind,
    },
}
