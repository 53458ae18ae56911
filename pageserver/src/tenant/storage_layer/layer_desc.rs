use pageserver_api::key::Key;
use std::ops::Range;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::tenant::layer_map::historic_layer_coverage::LayerKey;

use super::{DeltaLayerName, ImageLayerName, LayerName};

/// Everything the layer map needs to know about a persistent layer, without its content.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PersistentLayerDesc {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub key_range: Range<Key>,
    /// For image layer, this is `[lsn, lsn+1)`.
    pub lsn_range: Range<Lsn>,
    /// Whether this is a delta layer.
    pub is_delta: bool,
    /// Size of the layer file in bytes.
    pub file_size: u64,
}

impl PersistentLayerDesc {
    pub fn key(&self) -> LayerKey {
        LayerKey {
            key: self.key_range.clone(),
            lsn: self.lsn_range.clone(),
            is_image: !self.is_delta,
        }
    }

    pub fn new_img(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        key_range: Range<Key>,
        lsn: Lsn,
        file_size: u64,
    ) -> Self {
        Self {
            tenant_id,
            timeline_id,
            key_range,
            lsn_range: Self::image_layer_lsn_range(lsn),
            is_delta: false,
            file_size,
        }
    }

    pub fn new_delta(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        key_range: Range<Key>,
        lsn_range: Range<Lsn>,
        file_size: u64,
    ) -> Self {
        Self {
            tenant_id,
            timeline_id,
            key_range,
            lsn_range,
            is_delta: true,
            file_size,
        }
    }

    pub fn from_layer_name(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        name: &LayerName,
        file_size: u64,
    ) -> Self {
        match name {
            LayerName::Image(i) => {
                Self::new_img(tenant_id, timeline_id, i.key_range.clone(), i.lsn, file_size)
            }
            LayerName::Delta(d) => Self::new_delta(
                tenant_id,
                timeline_id,
                d.key_range.clone(),
                d.lsn_range.clone(),
                file_size,
            ),
        }
    }

    /// Get the LSN that the image layer covers.
    pub fn image_layer_lsn(&self) -> Lsn {
        assert!(!self.is_delta);
        assert!(self.lsn_range.start + 1 == self.lsn_range.end);
        self.lsn_range.start
    }

    /// Get the LSN range corresponding to a single image layer LSN.
    pub fn image_layer_lsn_range(lsn: Lsn) -> Range<Lsn> {
        lsn..(lsn + 1)
    }

    pub fn layer_name(&self) -> LayerName {
        if self.is_delta {
            DeltaLayerName {
                key_range: self.key_range.clone(),
                lsn_range: self.lsn_range.clone(),
            }
            .into()
        } else {
            ImageLayerName {
                key_range: self.key_range.clone(),
                lsn: self.lsn_range.start,
            }
            .into()
        }
    }

    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    pub fn get_key_range(&self) -> Range<Key> {
        self.key_range.clone()
    }

    pub fn get_lsn_range(&self) -> Range<Lsn> {
        self.lsn_range.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let desc = PersistentLayerDesc::new_delta(
            tenant_id,
            timeline_id,
            Key::new(1, 0)..Key::new(1, 100),
            Lsn(0x10)..Lsn(0x20),
            4096,
        );
        let name = desc.layer_name();
        assert_eq!(
            name.to_string(),
            "0000000100000000-0000000100000064__0000000000000010-0000000000000020"
        );
        assert_eq!(
            PersistentLayerDesc::from_layer_name(tenant_id, timeline_id, &name, 4096),
            desc
        );

        let image =
            PersistentLayerDesc::new_img(tenant_id, timeline_id, Key::MIN..Key::MAX, Lsn(7), 1);
        assert_eq!(image.lsn_range, Lsn(7)..Lsn(8));
        assert_eq!(image.image_layer_lsn(), Lsn(7));
        assert!(image.key().is_image);
    }
}
