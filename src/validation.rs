//! Output validation behind `/validate` and `/validate/batch`.

use serde_json::{json, Value};
use std::fs;

/// Default similarity a comparison must reach to count as a match.
pub const FUZZY_THRESHOLD: f64 = 0.85;

/// Checks produced files against expectations. Implementations may block on
/// file I/O.
pub trait Validator: Send + Sync {
    fn validate(&self, request: &Value) -> Value;

    fn validate_batch(&self, request: &Value) -> Value {
        let Some(validations) = request.get("validations").and_then(Value::as_array) else {
            return json!({
                "success": false,
                "error": "Missing or invalid 'validations' array",
            });
        };
        let results: Vec<Value> = validations.iter().map(|v| self.validate(v)).collect();
        json!({
            "success": true,
            "count": results.len(),
            "results": results,
        })
    }
}

#[derive(Debug, Default)]
struct Comparison {
    similarity: f64,
    matches: bool,
    report: String,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl Comparison {
    fn failed(error: String) -> Self {
        Self {
            errors: vec![error],
            ..Default::default()
        }
    }

    fn into_response(self, validation_type: &str, extra: Option<(&str, &str)>) -> Value {
        let mut body = json!({
            "success": self.matches,
            "validation_type": validation_type,
            "similarity": self.similarity,
            "matches": self.matches,
            "report": self.report,
            "warnings": self.warnings,
            "errors": self.errors,
        });
        if let (Some((key, value)), Some(map)) = (extra, body.as_object_mut()) {
            map.insert(key.to_string(), json!(value));
        }
        body
    }
}

/// Byte-level comparator. Similarity is `1 - MSE / 255^2` over the byte
/// streams, with the shorter one zero-padded.
#[derive(Debug, Clone)]
pub struct FileComparator {
    threshold: f64,
}

impl Default for FileComparator {
    fn default() -> Self {
        Self {
            threshold: FUZZY_THRESHOLD,
        }
    }
}

impl FileComparator {
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    fn filter(&self, request: &Value) -> Value {
        let [filter_type, input, output] =
            match required(request, ["filter_type", "input_file", "output_file"]) {
                Ok(fields) => fields,
                Err(body) => return body,
            };
        let mut result = match read_pair(input, output, "input", "output") {
            Ok((a, b)) => Comparison {
                similarity: similarity(&a, &b),
                matches: true,
                ..Default::default()
            },
            Err(error) => {
                return Comparison::failed(error)
                    .into_response("filter", Some(("filter_type", filter_type)))
            }
        };
        match filter_type {
            "blur" | "sharpen" if result.similarity > 0.95 => result
                .warnings
                .push("Output too similar to input (possible processing failure)".into()),
            "blur" | "sharpen" => {}
            other => result
                .warnings
                .push(format!("Validation not implemented for filter: {other}")),
        }
        result.report = format!("Filter {filter_type} similarity: {:.6}", result.similarity);
        result.into_response("filter", Some(("filter_type", filter_type)))
    }

    fn effect(&self, request: &Value) -> Value {
        let [effect_type, input, output] =
            match required(request, ["effect_type", "input_file", "output_file"]) {
                Ok(fields) => fields,
                Err(body) => return body,
            };
        let mut result = match read_pair(input, output, "input", "output") {
            Ok((a, b)) => Comparison {
                similarity: similarity(&a, &b),
                matches: true,
                ..Default::default()
            },
            Err(error) => {
                return Comparison::failed(error)
                    .into_response("effect", Some(("effect_type", effect_type)))
            }
        };
        if effect_type == "edge_detect" && result.similarity > 0.8 {
            result
                .errors
                .push("Edge detection output too similar to input".into());
            result.matches = false;
        }
        result.report = format!("Effect {effect_type} similarity: {:.6}", result.similarity);
        result.into_response("effect", Some(("effect_type", effect_type)))
    }

    fn video(&self, request: &Value) -> Value {
        let [input, output] = match required(request, ["input_file", "output_file"]) {
            Ok(fields) => fields,
            Err(body) => return body,
        };
        let result = match read_pair(input, output, "input", "output") {
            Ok((_, b)) if b.is_empty() => Comparison::failed(format!("Output video is empty: {output}")),
            Ok((a, b)) => {
                let similarity = similarity(&a, &b);
                Comparison {
                    similarity,
                    matches: true,
                    report: format!("Video similarity: {similarity:.6}"),
                    ..Default::default()
                }
            }
            Err(error) => Comparison::failed(error),
        };
        result.into_response("video", None)
    }

    fn images(&self, request: &Value) -> Value {
        let [expected, actual] = match required(request, ["expected_path", "actual_path"]) {
            Ok(fields) => fields,
            Err(body) => return body,
        };
        let strict = request
            .get("perceptual")
            .and_then(Value::as_bool)
            .map(|perceptual| !perceptual)
            .unwrap_or(false);
        let threshold = threshold(request).unwrap_or(if strict { 0.99 } else { self.threshold });
        compare(expected, actual, threshold).into_response("image_comparison", None)
    }

    fn file(&self, request: &Value) -> Value {
        let output = match required(request, ["output_file"]) {
            Ok([output]) => output,
            Err(body) => return body,
        };
        let result = match request.get("expected_file").and_then(Value::as_str) {
            Some(expected) if !expected.is_empty() => {
                compare(expected, output, threshold(request).unwrap_or(self.threshold))
            }
            _ => match fs::read(output) {
                Ok(bytes) if !bytes.is_empty() => Comparison {
                    similarity: 1.0,
                    matches: true,
                    report: format!("Output present ({} bytes)", bytes.len()),
                    ..Default::default()
                },
                Ok(_) => Comparison::failed(format!("Output file is empty: {output}")),
                Err(e) => Comparison::failed(format!("Cannot read output file: {output}: {e}")),
            },
        };
        result.into_response("file", None)
    }
}

impl Validator for FileComparator {
    fn validate(&self, request: &Value) -> Value {
        let validation_type = request.get("type").and_then(Value::as_str).unwrap_or("");
        match validation_type {
            "filter" => self.filter(request),
            "effect" => self.effect(request),
            "video" => self.video(request),
            "images" => self.images(request),
            "file" => self.file(request),
            other => json!({
                "success": false,
                "error": format!("Unknown validation type: {other}"),
            }),
        }
    }
}

/// `1 - MSE / 255^2`, in `[0, 1]`. Two empty inputs are identical.
pub fn similarity(a: &[u8], b: &[u8]) -> f64 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 1.0;
    }
    let squared: f64 = (0..len)
        .map(|i| {
            let x = f64::from(a.get(i).copied().unwrap_or(0));
            let y = f64::from(b.get(i).copied().unwrap_or(0));
            (x - y) * (x - y)
        })
        .sum();
    let mse = squared / len as f64;
    1.0 - (mse / (255.0 * 255.0)).min(1.0)
}

fn compare(expected: &str, actual: &str, threshold: f64) -> Comparison {
    let (a, b) = match read_pair(expected, actual, "expected", "actual") {
        Ok(pair) => pair,
        Err(error) => return Comparison::failed(error),
    };
    let mut result = Comparison {
        similarity: similarity(&a, &b),
        ..Default::default()
    };
    if a.len() != b.len() {
        result.warnings.push(format!(
            "Size mismatch: expected {} bytes, got {}",
            a.len(),
            b.len()
        ));
    }
    result.matches = result.similarity >= threshold;
    result.report = format!(
        "Similarity: {:.6} (threshold {threshold})",
        result.similarity
    );
    result
}

fn read_pair(
    first: &str,
    second: &str,
    first_label: &str,
    second_label: &str,
) -> Result<(Vec<u8>, Vec<u8>), String> {
    let a = fs::read(first).map_err(|e| format!("Cannot read {first_label} file: {first}: {e}"))?;
    let b =
        fs::read(second).map_err(|e| format!("Cannot read {second_label} file: {second}: {e}"))?;
    Ok((a, b))
}

fn threshold(request: &Value) -> Option<f64> {
    request
        .get("threshold")
        .and_then(Value::as_f64)
        .filter(|t| (0.0..=1.0).contains(t))
}

/// Pull non-empty string fields, or the error body naming all of them.
fn required<'a, const N: usize>(request: &'a Value, keys: [&str; N]) -> Result<[&'a str; N], Value> {
    let mut values = [""; N];
    for (slot, key) in values.iter_mut().zip(keys) {
        match request.get(key).and_then(Value::as_str) {
            Some(value) if !value.is_empty() => *slot = value,
            _ => {
                return Err(json!({
                    "success": false,
                    "error": format!("Missing required parameters: {}", keys.join(", ")),
                }))
            }
        }
    }
    Ok(values)
}
