use rusqlite::Connection;
use tracing::{debug, warn};

use crate::db;
use crate::error::{ChatError, Result};
use crate::models::{Message, MessageStatus};

/**
 * \brief 会话消息的唯一持有者，保持插入顺序。
 * \details 每次变更都会写穿到 SQLite；写入失败只记录警告，之后退化为纯内存模式。
 */
pub struct ConversationStore {
    messages: Vec<Message>,
    conn: Option<Connection>,
}

impl ConversationStore {
    /**
     * \brief 纯内存存储，用于测试与临时会话。
     */
    pub fn in_memory() -> Self {
        Self {
            messages: Vec::new(),
            conn: None,
        }
    }

    /**
     * \brief 绑定数据库连接；会先执行迁移。
     */
    pub fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        db::migrate(&conn)?;
        Ok(Self {
            messages: Vec::new(),
            conn: Some(conn),
        })
    }

    /** \brief 当前是否仍在写穿数据库。 */
    pub fn is_persistent(&self) -> bool {
        self.conn.is_some()
    }

    /**
     * \brief 从数据库载入历史，替换内存中的消息。
     * \details 上次退出时仍处于接收状态的消息会被标记为失败。
     */
    pub fn load_persisted(&mut self) -> Result<usize> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(self.messages.len());
        };
        let mut loaded = db::load_messages(conn)?;
        for message in loaded.iter_mut() {
            if message.status == MessageStatus::Streaming {
                message.status = MessageStatus::Failed;
                if let Err(e) = db::update_message_status(conn, &message.id, message.status) {
                    warn!(message_id = %message.id, error = %e, "failed to close interrupted message");
                }
            }
        }
        debug!(count = loaded.len(), "loaded persisted messages");
        self.messages = loaded;
        Ok(self.messages.len())
    }

    pub fn append(&mut self, message: Message) -> Result<()> {
        self.persist(|conn| db::insert_message(conn, &message));
        self.messages.push(message);
        Ok(())
    }

    /**
     * \brief 替换接收中消息的正文；新内容必须以旧内容为前缀。
     */
    pub fn update_content(&mut self, id: &str, content: &str) -> Result<()> {
        let message = self.find_mut(id)?;
        if message.status.is_frozen() {
            return Err(ChatError::MessageFrozen(id.to_string()));
        }
        if !content.starts_with(message.content.as_str()) {
            return Err(ChatError::NonContiguousUpdate(id.to_string()));
        }
        message.content.clear();
        message.content.push_str(content);
        self.persist(|conn| db::update_message_content(conn, id, content));
        Ok(())
    }

    /**
     * \brief 设置消息状态；冻结后的状态不可再变。
     */
    pub fn set_status(&mut self, id: &str, status: MessageStatus) -> Result<()> {
        let message = self.find_mut(id)?;
        if message.status == status {
            return Ok(());
        }
        if message.status.is_frozen() {
            return Err(ChatError::MessageFrozen(id.to_string()));
        }
        message.status = status;
        self.persist(|conn| db::update_message_status(conn, id, status));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.persist(db::clear_messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Message> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| ChatError::MessageNotFound(id.to_string()))
    }

    fn persist<F>(&mut self, write: F)
    where
        F: FnOnce(&Connection) -> anyhow::Result<()>,
    {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        if let Err(e) = write(conn) {
            warn!(error = %e, "conversation persistence failed; continuing in memory only");
            self.conn = None;
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
