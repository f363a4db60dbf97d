use crate::types::Detection;

/// Limit the detections of one image across all classes to `max_per_image`.
///
/// `per_class` holds one list per class for a single image. When the pooled
/// count exceeds the cap, the score at the cap-th rank becomes the cutoff
/// and everything strictly below it is dropped. Detections tied with the
/// cutoff are all kept, so the result can exceed the cap by the size of that
/// tie group. `max_per_image <= 0` disables capping.
///
/// Returns the number of detections removed.
pub fn cap_detections(per_class: &mut [Vec<Detection>], max_per_image: i64) -> usize {
    if max_per_image <= 0 {
        return 0;
    }
    let cap = max_per_image as usize;

    let mut pooled: Vec<f32> = per_class
        .iter()
        .flat_map(|dets| dets.iter().map(|d| d.score))
        .collect();

    if pooled.len() <= cap {
        return 0;
    }

    pooled.sort_unstable_by(|a, b| b.total_cmp(a));
    let cutoff = pooled[cap - 1];

    let before = pooled.len();
    for dets in per_class.iter_mut() {
        dets.retain(|d| d.score >= cutoff);
    }
    let after: usize = per_class.iter().map(Vec::len).sum();

    if after > cap {
        tracing::debug!(
            cap,
            kept = after,
            cutoff,
            "Score ties at the cutoff kept more detections than the cap"
        );
    }

    before - after
}
