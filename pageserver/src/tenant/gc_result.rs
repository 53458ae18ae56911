use serde::Serialize;
use std::ops::AddAssign;
use std::time::Duration;

/// What one GC pass did, per timeline or summed over a tenant.
#[derive(Default, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GcResult {
    pub timelines: u64,
    pub layers_total: u64,
    /// Layers ending above the cutoff.
    pub layers_needed_by_cutoff: u64,
    /// Layers below the cutoff that no newer image layer covers yet.
    pub layers_not_updated: u64,
    pub layers_removed: u64,
    pub bytes_removed: u64,

    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_millis() as u64)
}

impl AddAssign for GcResult {
    fn add_assign(&mut self, other: Self) {
        let GcResult {
            timelines,
            layers_total,
            layers_needed_by_cutoff,
            layers_not_updated,
            layers_removed,
            bytes_removed,
            elapsed,
        } = other;
        self.timelines += timelines;
        self.layers_total += layers_total;
        self.layers_needed_by_cutoff += layers_needed_by_cutoff;
        self.layers_not_updated += layers_not_updated;
        self.layers_removed += layers_removed;
        self.bytes_removed += bytes_removed;
        self.elapsed += elapsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_and_serializes_millis() {
        let mut total = GcResult {
            timelines: 1,
            layers_total: 4,
            layers_removed: 1,
            bytes_removed: 100,
            elapsed: Duration::from_millis(5),
            ..GcResult::default()
        };
        total += GcResult {
            timelines: 1,
            layers_total: 2,
            layers_not_updated: 2,
            elapsed: Duration::from_millis(7),
            ..GcResult::default()
        };
        assert_eq!(total.layers_total, 6);
        assert_eq!(total.bytes_removed, 100);

        let json = serde_json::to_value(&total).unwrap();
        assert_eq!(json["elapsed_ms"], 12);
        assert_eq!(json["timelines"], 2);
    }
}
