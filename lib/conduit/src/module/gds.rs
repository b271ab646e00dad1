//! Gds protocol module. A shared factory stamps out one module instance per
//! channel; each instance installs the frame codec handlers plus, when chunk
//! combining is on, a reassembly stage that folds partial frames into one
//! complete message per stream sequence.

use crate::buffer::ChunkedBuffer;
use crate::channel::Channel;
use crate::codec::gds::GdsFrame;
use crate::module::Module;
use crate::pipeline::HandlerId;
use lumen::shared::{NetworkError, NetworkResult};

/// Shared configuration handed to every per-channel instance.
pub struct GdsModuleFactory {
    combine_chunks: bool,
}

impl GdsModuleFactory {
    pub fn new(combine_chunks: bool) -> GdsModuleFactory {
        GdsModuleFactory { combine_chunks }
    }

    /// Channels own their instances; reassembly state never crosses
    /// channels.
    pub fn new_per_channel_instance(&self) -> GdsModule {
        GdsModule {
            combine_chunks: self.combine_chunks,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }
}

pub struct GdsModule {
    combine_chunks: bool,
    incoming: Vec<HandlerId>,
    outgoing: Vec<HandlerId>,
}

impl Module for GdsModule {
    fn name(&self) -> &'static str {
        "gds"
    }

    fn install(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        let max_frame_size = channel.config().max_frame_size;

        // Bytes -> frames.
        let id = channel.add_incoming_last::<ChunkedBuffer, _>(move |channel, item| {
            let mut buffer = match item.take::<ChunkedBuffer>() {
                Some(buffer) => buffer,
                None => return Ok(()),
            };

            match GdsFrame::parse(&mut buffer, channel.pool(), max_frame_size) {
                Ok(frame) => {
                    channel.restore_inbound(buffer);
                    item.put(frame);
                    Ok(())
                }
                Err(NetworkError::Incomplete) => {
                    item.put(buffer);
                    Ok(())
                }
                Err(error) => {
                    channel.restore_inbound(buffer);
                    Err(error)
                }
            }
        });
        self.incoming.push(id);

        // Chunk reassembly.
        let combine = self.combine_chunks;
        let mut accumulator: Option<GdsFrame> = None;

        let id = channel.add_incoming_last::<GdsFrame, _>(move |_, item| {
            let frame = match item.take::<GdsFrame>() {
                Some(frame) => frame,
                None => return Ok(()),
            };

            // Control frames and pass-through mode skip the accumulator.
            if frame.frame_type.is_control() || !combine {
                item.put(frame);
                return Ok(());
            }

            let merged = match accumulator.take() {
                Some(mut pending) if pending.stream_id == frame.stream_id => {
                    pending.merge(frame)?;
                    pending
                }
                Some(pending) => {
                    // A different stream interleaved; let the new frame
                    // through untouched and keep accumulating.
                    accumulator = Some(pending);
                    item.put(frame);
                    return Ok(());
                }
                None => frame,
            };

            if merged.is_complete {
                item.put(merged);
            } else {
                accumulator = Some(merged);
            }

            Ok(())
        });
        self.incoming.push(id);

        // Frames -> bytes.
        let id = channel.add_outgoing_last::<GdsFrame, _>(move |channel, item| {
            let mut frame = match item.take::<GdsFrame>() {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let mut buffer = ChunkedBuffer::new(channel.pool());
            frame.serialize(&mut buffer)?;
            item.put(buffer);

            Ok(())
        });
        self.outgoing.push(id);

        Ok(())
    }

    fn uninstall(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        for id in self.incoming.drain(..) {
            channel.remove_incoming(id);
        }
        for id in self.outgoing.drain(..) {
            channel.remove_outgoing(id);
        }

        Ok(())
    }
}
