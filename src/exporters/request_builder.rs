// SPDX-License-Identifier: Apache-2.0

use crate::compression::Compression;
use crate::exporters::Result;
use crate::record::AccessLogRecord;
use bytes::Bytes;

/// Builds the broker message payload for one record: the record JSON, or a
/// compressed envelope wrapping it.
#[derive(Clone, Debug, Default)]
pub struct RecordRequestBuilder {
    compression: Compression,
}

impl RecordRequestBuilder {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn build_message(&self, record: &AccessLogRecord) -> Result<Bytes> {
        let serialized = record.to_json()?;
        if !self.compression.is_enabled() {
            return Ok(Bytes::from(serialized));
        }

        let envelope = self.compression.envelope(&serialized)?;
        Ok(Bytes::from(envelope.to_json()?))
    }
}
