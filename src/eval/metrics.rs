//! Text and spatial accuracy metrics.
//!
//! - ANLS (Average Normalized Levenshtein Similarity) scores the answer text.
//! - IoU (Intersection over Union) scores the answer's bounding box.
//!
//! Boxes are `[x0, y0, x1, y1]` with `(x0, y0)` the top-left corner.

/// Default ANLS cutoff; similarities below it score zero.
pub const DEFAULT_ANLS_THRESHOLD: f64 = 0.5;

/// Default minimum box area, as a fraction of the image.
pub const DEFAULT_MIN_AREA_RATIO: f64 = 0.01;

/// The box models fall back to when they cannot locate an answer.
pub const FULL_IMAGE_BBOX: [f64; 4] = [0.0, 0.0, 1.0, 1.0];

/// Levenshtein edit distance between two strings, counted in characters.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    // Keep the shorter string in the row.
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };

    if short.is_empty() {
        return long.len();
    }

    let mut prev_row: Vec<usize> = (0..=short.len()).collect();
    let mut curr_row = vec![0; short.len() + 1];

    for (i, c1) in long.iter().enumerate() {
        curr_row[0] = i + 1;
        for (j, c2) in short.iter().enumerate() {
            let insertion = prev_row[j + 1] + 1;
            let deletion = curr_row[j] + 1;
            let substitution = prev_row[j] + usize::from(c1 != c2);
            curr_row[j + 1] = insertion.min(deletion).min(substitution);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[short.len()]
}

/// Normalized Levenshtein similarity between one prediction and one answer.
///
/// Both sides are lower-cased and trimmed. Two empty strings match
/// perfectly, a single empty side scores zero, and similarities under
/// `threshold` are clamped to zero.
pub fn single_anls(prediction: &str, ground_truth: &str, threshold: f64) -> f64 {
    let pred = prediction.trim().to_lowercase();
    let gt = ground_truth.trim().to_lowercase();

    match (pred.is_empty(), gt.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        (false, false) => {}
    }

    let distance = levenshtein_distance(&pred, &gt);
    let max_len = pred.chars().count().max(gt.chars().count());
    let score = 1.0 - distance as f64 / max_len as f64;

    if score < threshold { 0.0 } else { score }
}

/// ANLS of a prediction against the ground-truth answers of a sample.
///
/// Several ground truths are list items the answer must all contain, not
/// alternative phrasings: the prediction is split into lines, each item
/// takes its best-matching line, and the item scores are averaged. A
/// prediction that misses one of three items therefore scores at most 2/3.
pub fn anls(prediction: &str, ground_truths: &[String], threshold: f64) -> f64 {
    match ground_truths {
        [] => 0.0,
        [single] => single_anls(prediction, single, threshold),
        items => {
            let mut pred_items: Vec<&str> = prediction
                .split('\n')
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();

            if pred_items.is_empty() {
                let whole = prediction.trim();
                if whole.is_empty() {
                    return 0.0;
                }
                pred_items.push(whole);
            }

            let total: f64 = items
                .iter()
                .map(|gt| {
                    pred_items
                        .iter()
                        .map(|pred| single_anls(pred, gt, threshold))
                        .fold(0.0, f64::max)
                })
                .sum();

            total / items.len() as f64
        }
    }
}

/// Intersection over Union of two boxes. Anything but four coordinates
/// per box scores zero.
pub fn iou(pred_bbox: &[f64], gt_bbox: &[f64]) -> f64 {
    let (&[px0, py0, px1, py1], &[gx0, gy0, gx1, gy1]) = (pred_bbox, gt_bbox) else {
        return 0.0;
    };

    let x1 = px0.max(gx0);
    let y1 = py0.max(gy0);
    let x2 = px1.min(gx1);
    let y2 = py1.min(gy1);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);

    let pred_area = (px1 - px0) * (py1 - py0);
    let gt_area = (gx1 - gx0) * (gy1 - gy0);
    let union = pred_area + gt_area - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// Convert a pixel box into normalized `[0, 1]` coordinates.
///
/// Each coordinate is clamped to the image. Images without a positive size
/// fall back to the full-image box.
pub fn normalize_bbox(bbox: [f64; 4], width: i64, height: i64) -> [f64; 4] {
    if width <= 0 || height <= 0 {
        return FULL_IMAGE_BBOX;
    }

    let (w, h) = (width as f64, height as f64);
    let [x0, y0, x1, y1] = bbox;

    [
        (x0 / w).clamp(0.0, 1.0),
        (y0 / h).clamp(0.0, 1.0),
        (x1 / w).clamp(0.0, 1.0),
        (y1 / h).clamp(0.0, 1.0),
    ]
}

/// Whether a normalized box looks like a real annotation.
///
/// Rejects malformed shapes, inverted or empty boxes, the full-image
/// default and boxes smaller than `min_area_ratio` of the image.
pub fn validate_bbox(bbox: &[f64], min_area_ratio: f64) -> bool {
    let &[x0, y0, x1, y1] = bbox else {
        return false;
    };

    if x0 >= x1 || y0 >= y1 {
        return false;
    }

    if [x0, y0, x1, y1] == FULL_IMAGE_BBOX {
        return false;
    }

    (x1 - x0) * (y1 - y0) >= min_area_ratio
}
