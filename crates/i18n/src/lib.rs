use std::collections::BTreeMap;

use core_types::{GatewayError, UiLanguage};

#[derive(Debug, Clone)]
pub struct I18n {
    lang: UiLanguage,
    zh_cn: BTreeMap<&'static str, &'static str>,
    en_us: BTreeMap<&'static str, &'static str>,
}

impl I18n {
    pub fn new(lang: UiLanguage) -> Self {
        Self {
            lang,
            zh_cn: zh_cn_map(),
            en_us: en_us_map(),
        }
    }

    pub fn set_language(&mut self, lang: UiLanguage) {
        self.lang = lang;
    }

    pub fn language(&self) -> UiLanguage {
        self.lang
    }

    pub fn t<'a>(&'a self, key: &'a str) -> &'a str {
        match self.lang {
            UiLanguage::ZhCn => self
                .zh_cn
                .get(key)
                .copied()
                .or_else(|| self.en_us.get(key).copied())
                .unwrap_or(key),
            UiLanguage::EnUs => self
                .en_us
                .get(key)
                .copied()
                .or_else(|| self.zh_cn.get(key).copied())
                .unwrap_or(key),
        }
    }

    /// User-facing explanation of a gateway failure.
    pub fn error_hint(&self, err: &GatewayError) -> String {
        let key = format!("error.{}", err.code());
        let text = self.t(&key).to_string();
        if text == key {
            return err.to_string();
        }
        match err {
            GatewayError::ServerError(status) => format!("{text} ({status})"),
            _ => text,
        }
    }

    /// Whether retrying makes sense, phrased for the chat surface.
    pub fn retry_hint(&self, err: &GatewayError) -> &str {
        if err.is_retryable() {
            self.t("retry.possible")
        } else {
            self.t("retry.reconfigure")
        }
    }
}

fn zh_cn_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("app.title", "Murmur"),
        ("chat.prompt", "你"),
        ("chat.assistant", "助手"),
        ("chat.new", "新会话"),
        ("chat.cancelled", "已停止生成"),
        ("profile.active", "当前配置"),
        ("profile.reachable", "连接正常"),
        ("profile.auth_rejected", "服务可达，但密钥被拒绝"),
        ("error.invalid_url", "接口地址无效，请检查配置"),
        ("error.invalid_response", "服务返回了无法解析的内容"),
        ("error.authentication_failed", "认证失败，请检查 API 密钥"),
        ("error.rate_limited", "请求过于频繁，请稍后再试"),
        ("error.server_error", "服务端出错，请稍后再试"),
        ("error.transport_failure", "网络连接失败或超时"),
        ("error.unknown", "发生未知错误"),
        ("retry.possible", "可以重试"),
        ("retry.reconfigure", "请先修改配置再重试"),
    ])
}

fn en_us_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("app.title", "Murmur"),
        ("chat.prompt", "you"),
        ("chat.assistant", "assistant"),
        ("chat.new", "New conversation"),
        ("chat.cancelled", "Generation stopped"),
        ("profile.active", "Active profile"),
        ("profile.reachable", "Connection OK"),
        (
            "profile.auth_rejected",
            "Endpoint reachable, but the API key was rejected",
        ),
        ("error.invalid_url", "The endpoint URL is invalid, check the profile"),
        ("error.invalid_response", "The service sent a reply that could not be read"),
        ("error.authentication_failed", "Authentication failed, check your API key"),
        ("error.rate_limited", "Rate limited, try again later"),
        ("error.server_error", "The service had an error, try again later"),
        ("error.transport_failure", "Network failure or timeout"),
        ("error.unknown", "Something went wrong"),
        ("retry.possible", "Retrying may help"),
        ("retry.reconfigure", "Change the profile before retrying"),
    ])
}
