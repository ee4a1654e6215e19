use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use gf_core::Document;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 词汇检索配置
#[derive(Debug, Clone)]
pub struct LexicalConfig {
    /// 是否区分大小写
    pub case_sensitive: bool,
    /// 停用词列表
    pub stop_words: HashSet<String>,
    /// 最小词长 (按字符计)
    pub min_word_length: usize,
    /// 最大查询词数
    pub max_query_terms: usize,
    /// BM25 词频饱和参数
    pub k1: f64,
    /// BM25 文档长度归一化参数
    pub b: f64,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        let mut stop_words = HashSet::new();
        // 中文停用词
        for word in &[
            "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "一个", "上",
            "也", "很", "到", "说", "要", "去", "你", "会", "着", "没有", "看", "好", "自己", "这",
        ] {
            stop_words.insert(word.to_string());
        }
        // 英文停用词
        for word in &[
            "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
            "by", "this", "that", "is", "are", "was", "were", "be", "been", "have", "has", "had",
            "do", "does", "did", "will", "would", "could", "should",
        ] {
            stop_words.insert(word.to_string());
        }

        Self {
            case_sensitive: false,
            stop_words,
            min_word_length: 2,
            max_query_terms: 20,
            k1: 1.5,
            b: 0.75,
        }
    }
}

impl LexicalConfig {
    /// 分词和预处理
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let text = if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };

        // 按非字母数字字符切分，覆盖中英文标点
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|word| {
                word.chars().count() >= self.min_word_length && !self.stop_words.contains(*word)
            })
            .map(str::to_string)
            .collect()
    }

    /// 查询分词：去重并限制词数
    pub fn query_terms(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .take(self.max_query_terms)
            .collect()
    }
}

/// 词汇检索命中
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub document: Arc<Document>,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

/// BM25 词汇索引，构建后只读，整体替换实现重载
#[derive(Debug, Default)]
pub struct LexicalIndex {
    config: LexicalConfig,
    /// 文档 -> 词频统计
    document_term_freq: HashMap<String, HashMap<String, u32>>,
    /// 文档 -> 词数
    document_length: HashMap<String, u32>,
    /// 词 -> 包含该词的文档列表
    inverted_index: HashMap<String, HashSet<String>>,
    /// 文档 -> 文档内容
    documents: HashMap<String, Arc<Document>>,
    average_document_length: f64,
}

impl LexicalIndex {
    pub fn build(documents: &[Arc<Document>], config: LexicalConfig) -> Self {
        let mut index = LexicalIndex {
            config,
            ..Default::default()
        };

        for doc in documents {
            let tokens = index.config.tokenize(&doc.text);
            let term_freq = calculate_term_frequency(&tokens);

            // 更新倒排索引
            for term in term_freq.keys() {
                index
                    .inverted_index
                    .entry(term.clone())
                    .or_default()
                    .insert(doc.id.clone());
            }

            index
                .document_length
                .insert(doc.id.clone(), tokens.len() as u32);
            index.document_term_freq.insert(doc.id.clone(), term_freq);
            index.documents.insert(doc.id.clone(), doc.clone());
        }

        let total = index.documents.len();
        index.average_document_length = if total > 0 {
            index.document_length.values().map(|l| *l as f64).sum::<f64>() / total as f64
        } else {
            0.0
        };

        debug!(
            documents = total,
            terms = index.inverted_index.len(),
            "词汇索引构建完成"
        );
        index
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Document>> {
        self.documents.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Arc<Document>> {
        self.documents.values()
    }

    /// 执行词汇搜索，只返回分数为正的文档，按分数降序、id 升序
    pub fn search(&self, query: &str, limit: usize) -> Vec<LexicalHit> {
        let query_terms = self.config.query_terms(query);
        if query_terms.is_empty() || limit == 0 {
            return vec![];
        }

        // 收集候选文档
        let mut candidates = HashSet::new();
        for term in &query_terms {
            if let Some(docs) = self.inverted_index.get(term) {
                candidates.extend(docs.iter());
            }
        }

        let mut hits: Vec<LexicalHit> = candidates
            .into_iter()
            .filter_map(|doc_id| {
                let document = self.documents.get(doc_id)?;
                let (score, matched_terms) = self.score(&query_terms, doc_id);
                (score > 0.0).then(|| LexicalHit {
                    document: document.clone(),
                    score,
                    matched_terms,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        hits.truncate(limit);

        debug!(
            terms = query_terms.len(),
            results = hits.len(),
            "词汇搜索完成"
        );
        hits
    }

    /// 非负 IDF：ln(1 + (N - n + 0.5) / (n + 0.5))
    fn idf(&self, term: &str) -> f64 {
        let n = self
            .inverted_index
            .get(term)
            .map(|docs| docs.len())
            .unwrap_or(0) as f64;
        let total = self.documents.len() as f64;
        (1.0 + (total - n + 0.5) / (n + 0.5)).ln()
    }

    /// 计算 BM25 分数
    fn score(&self, query_terms: &[String], doc_id: &str) -> (f64, Vec<String>) {
        let Some(term_freq) = self.document_term_freq.get(doc_id) else {
            return (0.0, vec![]);
        };
        let doc_len = self.document_length.get(doc_id).copied().unwrap_or(0) as f64;
        let avg_len = self.average_document_length.max(f64::EPSILON);
        let (k1, b) = (self.config.k1, self.config.b);

        let mut score = 0.0;
        let mut matched = Vec::new();
        for term in query_terms {
            if let Some(&tf) = term_freq.get(term) {
                let tf = tf as f64;
                let norm = tf + k1 * (1.0 - b + b * doc_len / avg_len);
                score += self.idf(term) * tf * (k1 + 1.0) / norm;
                matched.push(term.clone());
            }
        }
        (score, matched)
    }

    /// 获取索引统计信息
    pub fn stats(&self) -> LexicalIndexStats {
        LexicalIndexStats {
            total_documents: self.documents.len(),
            total_terms: self.inverted_index.len(),
            average_document_length: self.average_document_length,
        }
    }
}

/// 计算词频
fn calculate_term_frequency(tokens: &[String]) -> HashMap<String, u32> {
    let mut term_freq = HashMap::new();
    for token in tokens {
        *term_freq.entry(token.clone()).or_insert(0) += 1;
    }
    term_freq
}

/// 词汇索引统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LexicalIndexStats {
    pub total_documents: usize,
    pub total_terms: usize,
    pub average_document_length: f64,
}
