//! # 对话消息结构体
//!
//! 会话中发送的消息，发送后不可变

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// 通用聊天消息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// 消息 ID（响应矩阵的列键）
    pub id: String,
    pub role: Role,
    /// 消息文本
    pub content: String,
    /// 图像附件：data URL 或 http(s) URL
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// 创建系统消息
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 创建用户消息
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// 创建助手消息
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// 为消息添加图像（多模态支持）
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// 指定消息 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// 解析后的图像附件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource<'a> {
    /// `data:<media_type>;base64,<data>`
    Base64 { media_type: &'a str, data: &'a str },
    /// 远程地址
    Url(&'a str),
}

/// 解析图像附件字符串；无法识别的格式按 URL 处理
pub fn parse_image(image: &str) -> ImageSource<'_> {
    if let Some(rest) = image.strip_prefix("data:") {
        if let Some((header, data)) = rest.split_once(',') {
            if let Some(media_type) = header.strip_suffix(";base64") {
                return ImageSource::Base64 { media_type, data };
            }
        }
    }
    ImageSource::Url(image)
}
