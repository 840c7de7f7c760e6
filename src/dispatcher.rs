//! The sequential dispatch loop: receive one datagram, decode it, route it,
//! send the reply, repeat — until `Shutdown` or a clean EOF.

use log::{info, warn};

use crate::{
    error::FramingError,
    handlers::{Outcome, ProxyState},
    image::ImageLibrary,
    protocol::{decode_request, encode_reply},
    transport::Transport,
};

/// Drives one proxy session to completion.
pub struct Dispatcher<L: ImageLibrary> {
    transport: Transport,
    state: ProxyState<L>,
}
impl<L: ImageLibrary> Dispatcher<L> {
    pub fn new(transport: Transport, state: ProxyState<L>) -> Self {
        Self { transport, state }
    }

    /// Runs the loop. Returns `Ok(())` on clean `Shutdown` or EOF; an `Err`
    /// means the transport itself failed (recv/send), which is fatal.
    pub fn run(&self) -> Result<(), FramingError> {
        loop {
            let bytes = match self.transport.recv()? {
                Some(bytes) => bytes,
                None => {
                    info!("peer closed the control socket; exiting");
                    return Ok(());
                }
            };

            let request = match decode_request(&bytes) {
                Ok(req) => req,
                Err(e) => {
                    // A decode-stage framing error (oversized packet,
                    // malformed JSON) produces an error reply; the loop
                    // continues. Only a `recv`/`send` failure is fatal.
                    warn!("malformed request: {e}");
                    let reply = crate::protocol::Reply::err(e.to_string());
                    // Per the existing parent's behavior, a send failure
                    // here is not itself treated as fatal; any error is
                    // simply not propagated further.
                    let _ = self.transport.send(&encode_reply(&reply), None);
                    continue;
                }
            };

            match self.state.dispatch(&request.method, &request.args) {
                Outcome::Shutdown => {
                    info!("Shutdown received; exiting without a reply");
                    return Ok(());
                }
                Outcome::Reply(reply, fd) => {
                    self.transport.send(&encode_reply(&reply), fd)?;
                }
            }
        }
    }
}
