use async_trait::async_trait;

use crate::{EmbedModel, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 基于特征哈希的本地嵌入模型：确定性、无网络依赖，适合离线部署与测试
#[derive(Debug, Clone)]
pub struct HashingEmbedModel {
    dimensions: usize,
}

impl HashingEmbedModel {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn fnv1a(token: &str) -> u64 {
        token.bytes().fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (Self::fnv1a(token) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbedModel for HashingEmbedModel {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let model = HashingEmbedModel::new(256);
        let a = model.embed_text("What is composting?");
        let b = model.embed_text("what is composting");
        assert_eq!(a, b);
        assert!((dot(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let model = HashingEmbedModel::new(16);
        assert!(model.embed_text("  ?! ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_shared_terms_increase_similarity() {
        let model = HashingEmbedModel::new(256);
        let query = model.embed_text("How does solar energy help the environment?");
        let solar = model.embed_text("solar panels reduce emissions");
        let unrelated = model.embed_text("recycling programs cut waste");
        assert!(dot(&query, &solar) > dot(&query, &unrelated));
    }
}
