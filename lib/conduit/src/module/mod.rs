//! Installable protocol modules. A module registers pipeline handlers (and
//! usually performs an upgrade handshake) on `install`, and removes them on
//! `uninstall`. Install and uninstall failures are reported by the channel
//! but are not fatal to it.

pub mod gds;
pub mod http1;
pub mod http2;
pub mod websocket;

use crate::channel::Channel;
use lumen::shared::NetworkResult;

pub trait Module {
    fn name(&self) -> &'static str;

    fn install(&mut self, channel: &mut Channel) -> NetworkResult<()>;

    fn uninstall(&mut self, channel: &mut Channel) -> NetworkResult<()>;
}
