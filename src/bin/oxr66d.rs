#![deny(unsafe_code)]

use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let code = r66_daemon::run(env::args_os());
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
