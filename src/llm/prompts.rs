//! Evaluation prompts, one per supported answer language.
//!
//! The answer rules mirror the annotation guidelines so that model answers
//! are formatted like the ground truth (bare numbers, yyyy/MM/dd dates,
//! one list item per line).

/// Language used when a sample's language has no dedicated prompt.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Collection of prompts used to query the predictor.
pub struct Prompts;

impl Prompts {
    /// Languages with a dedicated prompt.
    pub fn supported_languages() -> &'static [&'static str] {
        &["ja", "en", "zh", "ko"]
    }

    /// Prompt template for a language, with a `{question}` placeholder.
    pub fn template(language: &str) -> &'static str {
        match language {
            "ja" => Self::japanese(),
            "zh" => Self::chinese(),
            "ko" => Self::korean(),
            _ => Self::english(),
        }
    }

    /// The full evaluation prompt for a question.
    pub fn evaluation(question: &str, language: &str) -> String {
        Self::template(language).replace("{question}", question)
    }

    fn japanese() -> &'static str {
        r#"画像を見て質問に答えてください。

質問: {question}

回答ルール:
- 「金額」「合計」「税」「対象」を聞かれたら → 数字のみ出力
- 「日付」を聞かれたら → yyyy/MM/dd形式で出力
- 「品目」「商品」「購入したもの」を聞かれたら → 商品の名前のみ出力（価格・数量・「合計」は除外）
- 「番号」「登録番号」を聞かれたら → Tで始まる番号のみ出力
- 複数ある場合 → 1行に1つ（改行で区切る）

JSON形式で返答してください:
{"answer": "回答テキスト", "bbox": [x0, y0, x1, y1]}

bboxは正規化座標（0-1範囲）で、回答が見つかる領域を指定してください。
説明文は不要。JSONのみ返してください。"#
    }

    fn english() -> &'static str {
        r#"Look at the image and answer the question.

Question: {question}

Answer rules:
- If asking for "amount", "total", "tax" → output numbers only
- If asking for "date" → output in yyyy/MM/dd format
- If asking for "items", "products", "purchases" → output product names only (exclude prices, quantities, "total")
- If asking for "number", "registration number" → output the number only (starting with T if applicable)
- If multiple items → one per line (separate with newlines)

Return as JSON format:
{"answer": "your answer text", "bbox": [x0, y0, x1, y1]}

bbox should be normalized coordinates (0-1 range) indicating where the answer is found.
No explanations needed. Return ONLY valid JSON."#
    }

    fn chinese() -> &'static str {
        r#"查看图像并回答问题。

问题: {question}

回答规则:
- 询问「金额」「合计」「税」→ 只输出数字
- 询问「日期」→ 以yyyy/MM/dd格式输出
- 询问「品目」「商品」「购买的东西」→ 只输出商品名称（排除价格、数量、「合计」）
- 询问「号码」「登记号」→ 只输出号码（如适用以T开头）
- 多个项目 → 每行一个（用换行符分隔）

以JSON格式返回:
{"answer": "回答文本", "bbox": [x0, y0, x1, y1]}

bbox应为正规化坐标（0-1范围），指示答案所在的区域。
不需要解释。只返回有效的JSON。"#
    }

    fn korean() -> &'static str {
        r#"이미지를 보고 질문에 답하세요.

질문: {question}

답변 규칙:
- 「금액」「합계」「세금」을 물으면 → 숫자만 출력
- 「날짜」를 물으면 → yyyy/MM/dd 형식으로 출력
- 「품목」「상품」「구매한 것」을 물으면 → 상품 이름만 출력 (가격, 수량, 「합계」 제외)
- 「번호」「등록번호」를 물으면 → 번호만 출력 (해당되면 T로 시작)
- 여러 항목 → 한 줄에 하나씩 (줄바꿈으로 구분)

JSON 형식으로 반환:
{"answer": "답변 텍스트", "bbox": [x0, y0, x1, y1]}

bbox는 정규화된 좌표(0-1 범위)로, 답변이 발견된 영역을 지정하세요.
설명 불필요. 유효한 JSON만 반환하세요."#
    }
}
