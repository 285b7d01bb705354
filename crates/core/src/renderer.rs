use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use echarts_export_domain::ChartConfig;
use echarts_export_errors::{ExportError, ExportResult};

/// 渲染产物
#[derive(Debug, Clone)]
pub struct RenderedChart {
    pub buffer: Vec<u8>,
    pub content_type: String,
    pub extension: String,
}

/// 图表栅格化器
///
/// 引擎不关心渲染的正确性，只消费 字节缓冲 + MIME + 扩展名 的契约。
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, config: &ChartConfig, task_id: Uuid) -> ExportResult<RenderedChart>;
}

/// option 必须携带 series 或 dataset 之一
pub fn validate_chart_option(option: &Value) -> ExportResult<()> {
    let has_series = option.get("series").is_some();
    let has_dataset = option.get("dataset").is_some();
    if has_series || has_dataset {
        Ok(())
    } else {
        Err(ExportError::InvalidChartOption)
    }
}

const DEFAULT_WIDTH: f64 = 800.0;
const DEFAULT_HEIGHT: f64 = 600.0;

/// 内置SVG渲染器
///
/// 只产出SVG：从 option 的第一个 series 提取数值画成柱状或折线标记。
/// 栅格格式（png/jpeg/pdf）需要注入外部渲染器，这里按契约报
/// unsupported image type，走正常的失败/重试路径。
pub struct SvgChartRenderer;

#[async_trait]
impl ChartRenderer for SvgChartRenderer {
    async fn render(&self, config: &ChartConfig, _task_id: Uuid) -> ExportResult<RenderedChart> {
        validate_chart_option(&config.option)?;

        // 未指定类型时按本渲染器的原生格式处理
        let requested = config.chart_type.as_deref().unwrap_or("svg");
        if requested != "svg" {
            return Err(ExportError::UnsupportedImageType(requested.to_string()));
        }

        let width = config.width.unwrap_or(DEFAULT_WIDTH);
        let height = config.height.unwrap_or(DEFAULT_HEIGHT);
        let svg = render_svg(&config.option, width, height);

        Ok(RenderedChart {
            buffer: svg.into_bytes(),
            content_type: "image/svg+xml".to_string(),
            extension: "svg".to_string(),
        })
    }
}

fn render_svg(option: &Value, width: f64, height: f64) -> String {
    let title = option
        .pointer("/title/text")
        .and_then(Value::as_str)
        .unwrap_or("");
    let series = option.pointer("/series/0");
    let series_type = series
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("bar");
    let data = extract_numbers(series.and_then(|s| s.get("data")));

    let mut body = String::new();
    body.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    ));
    body.push_str(&format!(
        r##"<rect x="0" y="0" width="{width}" height="{height}" fill="#ffffff"/>"##
    ));
    if !title.is_empty() {
        body.push_str(&format!(
            r#"<text x="{}" y="24" font-size="16" text-anchor="middle">{}</text>"#,
            width / 2.0,
            escape_xml(title)
        ));
    }

    // 绘图区域留出标题与坐标轴边距
    let plot_left = 40.0;
    let plot_top = 40.0;
    let plot_width = (width - 60.0).max(1.0);
    let plot_height = (height - 80.0).max(1.0);
    let max_value = data.iter().cloned().fold(f64::MIN, f64::max).max(1.0);

    if series_type == "line" && data.len() > 1 {
        let step = plot_width / (data.len() - 1) as f64;
        let points: Vec<String> = data
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let x = plot_left + step * i as f64;
                let y = plot_top + plot_height * (1.0 - v / max_value);
                format!("{x:.1},{y:.1}")
            })
            .collect();
        body.push_str(&format!(
            r##"<polyline fill="none" stroke="#5470c6" stroke-width="2" points="{}"/>"##,
            points.join(" ")
        ));
    } else if !data.is_empty() {
        let slot = plot_width / data.len() as f64;
        let bar_width = (slot * 0.6).max(1.0);
        for (i, v) in data.iter().enumerate() {
            let bar_height = plot_height * (v / max_value);
            let x = plot_left + slot * i as f64 + (slot - bar_width) / 2.0;
            let y = plot_top + plot_height - bar_height;
            body.push_str(&format!(
                r##"<rect x="{x:.1}" y="{y:.1}" width="{bar_width:.1}" height="{bar_height:.1}" fill="#5470c6"/>"##
            ));
        }
    }

    body.push_str(&format!(
        r##"<line x1="{plot_left}" y1="{}" x2="{}" y2="{}" stroke="#6e7079"/>"##,
        plot_top + plot_height,
        plot_left + plot_width,
        plot_top + plot_height
    ));
    body.push_str("</svg>");
    body
}

fn extract_numbers(data: Option<&Value>) -> Vec<f64> {
    data.and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| match v {
                    Value::Number(n) => n.as_f64(),
                    // ECharts 也允许 {value: n} 形式的数据项
                    Value::Object(obj) => obj.get("value").and_then(Value::as_f64),
                    _ => None,
                })
                .filter(|v| v.is_finite() && *v >= 0.0)
                .collect()
        })
        .unwrap_or_default()
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
