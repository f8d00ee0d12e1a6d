// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Packing active-channel subsets into the chain's working buffer.
//!
//! Clients only send the channels their active mask declares; the chain
//! processes the full session layout. The mapper copies the i-th active
//! input channel of a client block into its declared slot of the working
//! buffer and, after processing, the active output slots back into the
//! client block.

use remoterack_plugin_api::{AudioBuffer, Sample};
use remoterack_wire::SessionParams;

/// Maps between a client block's packed channels and the working buffer's
/// declared channel slots.
#[derive(Debug, Clone)]
pub struct ChannelMapper {
    /// `(working slot, client channel)` pairs for inputs.
    inputs: Vec<(usize, usize)>,
    /// `(working slot, client channel)` pairs for outputs.
    outputs: Vec<(usize, usize)>,
}

impl ChannelMapper {
    /// Build the mapping from the session's declared channels and mask.
    pub fn new(params: &SessionParams) -> Self {
        let declared_in = params.channels_in + params.channels_sc;
        let inputs = (0..declared_in)
            .filter(|&slot| params.active_channels.input_active(slot))
            .enumerate()
            .map(|(rank, slot)| (slot, rank))
            .collect();
        let outputs = (0..params.channels_out)
            .filter(|&slot| params.active_channels.output_active(slot))
            .enumerate()
            .map(|(rank, slot)| (slot, rank))
            .collect();
        Self { inputs, outputs }
    }

    /// Whether any input channel is active.
    pub fn has_active_inputs(&self) -> bool {
        !self.inputs.is_empty()
    }

    /// Channels a client block must carry at minimum.
    pub fn min_client_channels(&self) -> usize {
        self.inputs.len().max(self.outputs.len())
    }

    /// Copy active client channels into their working-buffer slots,
    /// silencing everything else.
    pub fn pack<S: Sample>(&self, client: &AudioBuffer<S>, working: &mut AudioBuffer<S>) {
        working.clear();
        for &(slot, channel) in &self.inputs {
            if channel < client.num_channels() && slot < working.num_channels() {
                working.copy_channel_from(slot, client, channel);
            }
        }
    }

    /// Copy active output slots of the working buffer back into the client
    /// block. Inactive client channels are left untouched.
    pub fn unpack<S: Sample>(&self, working: &AudioBuffer<S>, client: &mut AudioBuffer<S>) {
        for &(slot, channel) in &self.outputs {
            if channel < client.num_channels() && slot < working.num_channels() {
                client.copy_channel_from(channel, working, slot);
            }
        }
    }
}
