//! CLI entry point: parse the one `--sockfd` flag, install the logger, run
//! the dispatcher against the real `oci-client`-backed image library, and
//! map the outcome to a process exit code.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process::ExitCode;

use image_fetch_proxy::{
    dispatcher::Dispatcher, handlers::ProxyState, image::adapter::OciAdapter,
    transport::Transport,
};
use log::error;

const DEFAULT_SOCKFD: RawFd = 0;

fn parse_sockfd(args: impl Iterator<Item = String>) -> Result<RawFd, String> {
    let mut sockfd = DEFAULT_SOCKFD;
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sockfd" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--sockfd requires an argument".to_owned())?;
                sockfd = value
                    .parse()
                    .map_err(|_| format!("--sockfd: {value:?} is not a valid fd number"))?;
            }
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }
    Ok(sockfd)
}

fn main() -> ExitCode {
    env_logger::init();

    let sockfd = match parse_sockfd(std::env::args().skip(1)) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("image-fetch-proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    // SAFETY: the parent guarantees `sockfd` names an already-connected
    // SOCK_SEQPACKET socket handed to us for the lifetime of this process.
    let fd = unsafe { OwnedFd::from_raw_fd(sockfd) };
    let transport = Transport::from_fd(fd);

    let state = ProxyState::new(OciAdapter::new);
    let dispatcher = Dispatcher::new(transport, state);

    match dispatcher.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal transport error: {e}");
            ExitCode::FAILURE
        }
    }
}
