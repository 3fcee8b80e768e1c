//! 提示词构建：明星人设 system prompt + 记忆 system prompt + 带历史的 user 消息

use crate::chat::models::{Persona, SenderKind, StoredMessage};
use crate::memory::Message;

/// 提示词构建器；history_limit 为拼入 user 消息的最近消息条数
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    history_limit: usize,
}

impl PromptBuilder {
    pub fn new(history_limit: usize) -> Self {
        Self { history_limit }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// 人设 system prompt
    pub fn system_prompt(&self, persona: &Persona) -> String {
        let mut s = format!("你现在需要扮演{}", persona.name);
        if !persona.english_name.is_empty() {
            s.push_str(&format!("（{}）", persona.english_name));
        }
        s.push_str("，请始终以该角色的身份对话。\n\n## 人物背景\n");
        if !persona.introduction.is_empty() {
            s.push_str(&format!("- 个人简介：{}\n", persona.introduction));
        }
        if !persona.style_features.is_empty() {
            s.push_str(&format!("\n## 语言风格\n{}\n", persona.style_features));
        }
        s.push_str(
            "\n## 对话规则\n\
             1. 完全沉浸在角色中，语言自然、口语化\n\
             2. 记住之前的对话内容和用户提到的重要信息\n\
             3. 不要透露自己是 AI\n\
             4. 回答简洁，遇到不合适的问题可以委婉拒绝\n",
        );
        s
    }

    /// 记忆 system prompt；没有记忆时返回 None
    pub fn memory_prompt(&self, persona: &Persona, memories: &[String]) -> Option<String> {
        if memories.is_empty() {
            return None;
        }
        let mut s = format!("作为{}，请记住以下来自之前对话的信息，并在回应中自然地参考：\n", persona.name);
        for m in memories {
            s.push_str(&format!("- {}\n", m));
        }
        Some(s)
    }

    /// 历史对话 + 当前输入，只保留最近 history_limit 条
    pub fn history_prompt(&self, recent: &[StoredMessage], current_input: &str) -> String {
        let start = recent.len().saturating_sub(self.history_limit);
        let mut s = String::new();
        for msg in &recent[start..] {
            let speaker = match msg.sender {
                SenderKind::Persona(_) => "你",
                SenderKind::User(_) => "用户",
                SenderKind::System => "系统",
            };
            s.push_str(&format!("{}: {}\n", speaker, msg.content));
        }
        s.push_str(&format!("用户: {}", current_input));
        s
    }

    /// 完整消息列表：人设 system、可选记忆 system、一条 user
    pub fn build_messages(
        &self,
        persona: &Persona,
        recent: &[StoredMessage],
        current_input: &str,
        memories: &[String],
    ) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_prompt(persona))];
        if let Some(memory) = self.memory_prompt(persona, memories) {
            messages.push(Message::system(memory));
        }
        messages.push(Message::user(self.history_prompt(recent, current_input)));
        messages
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use chrono::Utc;

    fn stored(sender: SenderKind, content: &str) -> StoredMessage {
        StoredMessage {
            id: 0,
            conversation_id: 1,
            sender,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_messages_without_memories() {
        let builder = PromptBuilder::new(10);
        let persona = Persona::new(2, "小明").with_style("爱用感叹号！");
        let msgs = builder.build_messages(&persona, &[], "你好", &[]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert!(msgs[0].content.contains("小明"));
        assert!(msgs[0].content.contains("爱用感叹号"));
        assert_eq!(msgs[1].content, "用户: 你好");
    }

    #[test]
    fn test_history_is_truncated_to_limit() {
        let builder = PromptBuilder::new(2);
        let persona = Persona::new(2, "小明");
        let recent = vec![
            stored(SenderKind::User(1), "one"),
            stored(SenderKind::Persona(2), "two"),
            stored(SenderKind::User(1), "three"),
        ];
        let msgs = builder.build_messages(&persona, &recent, "four", &["喜欢猫".to_string()]);
        assert_eq!(msgs.len(), 3);
        assert!(msgs[1].content.contains("- 喜欢猫"));
        assert_eq!(msgs[2].content, "你: two\n用户: three\n用户: four");
    }
}
