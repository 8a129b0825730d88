//! Distance metrics and filter modes.

use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest `top_k` a caller may ask for.
pub const MAX_TOP_K: usize = 100;

/// How query/chunk distance is measured. Lower distance is closer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`
    #[default]
    Cosine,
    /// L2 distance
    Euclidean,
    /// `-dot(a, b)`
    InnerProduct,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::InnerProduct => "inner_product",
        }
    }

    pub fn distance(&self, query: &[f32], stored: &[f16]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(query, stored),
            DistanceMetric::Euclidean => query
                .iter()
                .zip(stored)
                .map(|(a, b)| {
                    let d = a - b.to_f32();
                    d * d
                })
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::InnerProduct => -dot(query, stored),
        }
    }

    /// Similarity for a distance under this metric. Higher is closer.
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance),
            DistanceMetric::InnerProduct => -distance,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "inner_product" | "inner-product" | "dot" => Ok(DistanceMetric::InnerProduct),
            other => Err(format!(
                "unknown metric '{other}', expected cosine, euclidean or inner_product"
            )),
        }
    }
}

/// Where metadata filters on indexed columns are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Narrow candidates in SQL before scoring
    #[default]
    Pre,
    /// Score everything, keep `top_k`, then drop non-matching results.
    /// May return fewer than `top_k` results.
    Post,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Pre => "pre",
            FilterMode::Post => "post",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pre" => Ok(FilterMode::Pre),
            "post" => Ok(FilterMode::Post),
            other => Err(format!("unknown filter mode '{other}', expected pre or post")),
        }
    }
}

fn dot(a: &[f32], b: &[f16]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y.to_f32()).sum()
}

/// Zero vectors have similarity 0 to everything.
fn cosine_similarity(a: &[f32], b: &[f16]) -> f32 {
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x.to_f32().powi(2)).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(values: &[f32]) -> Vec<f16> {
        values.iter().map(|v| f16::from_f32(*v)).collect()
    }

    #[test]
    fn test_cosine() {
        let m = DistanceMetric::Cosine;
        assert!(m.distance(&[1.0, 0.0], &h(&[1.0, 0.0])).abs() < 1e-6);
        assert!((m.distance(&[1.0, 0.0], &h(&[0.0, 1.0])) - 1.0).abs() < 1e-6);
        assert!((m.distance(&[1.0, 0.0], &h(&[-1.0, 0.0])) - 2.0).abs() < 1e-6);
        assert!((m.distance(&[0.0, 0.0], &h(&[1.0, 0.0])) - 1.0).abs() < 1e-6);
        assert!((m.similarity(0.25) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean() {
        let m = DistanceMetric::Euclidean;
        assert!((m.distance(&[0.0, 0.0], &h(&[3.0, 4.0])) - 5.0).abs() < 1e-6);
        assert_eq!(m.similarity(0.0), 1.0);
        assert!((m.similarity(1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_inner_product() {
        let m = DistanceMetric::InnerProduct;
        assert!((m.distance(&[1.0, 2.0], &h(&[3.0, 4.0])) + 11.0).abs() < 1e-6);
        assert!((m.similarity(-11.0) - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("L2".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!(
            "inner_product".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::InnerProduct
        );
        assert!("manhattan".parse::<DistanceMetric>().is_err());
        assert_eq!("POST".parse::<FilterMode>().unwrap(), FilterMode::Post);
        assert!("both".parse::<FilterMode>().is_err());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&DistanceMetric::InnerProduct).unwrap(),
            "\"inner_product\""
        );
        assert_eq!(serde_json::to_string(&FilterMode::Pre).unwrap(), "\"pre\"");
    }
}
