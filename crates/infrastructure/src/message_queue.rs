use async_trait::async_trait;
use crontask_config::MessageQueueConfig;
use crontask_domain::{DispatchMessage, MessagePublisher, Priority};
use crontask_errors::{SchedulerError, SchedulerResult};
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// RabbitMQ 发布端
///
/// 启动时声明 topic 交换机，以及同名的持久化优先级队列（绑定 `<exchange>.#`）。
/// 发布是尽力而为的：失败会记录日志并返回错误，不做重试。
pub struct RabbitMqPublisher {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    config: MessageQueueConfig,
}

impl RabbitMqPublisher {
    pub async fn new(config: MessageQueueConfig) -> SchedulerResult<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建通道失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        let publisher = Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            config,
        };
        publisher.declare_topology().await?;
        Ok(publisher)
    }

    async fn declare_topology(&self) -> SchedulerResult<()> {
        let exchange = self.config.exchange.as_str();
        if exchange.is_empty() {
            return Ok(());
        }
        let channel = self.channel.lock().await;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("声明交换机 {exchange} 失败: {e}")))?;

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-max-priority".into(),
            AMQPValue::ShortShortUInt(self.config.max_priority),
        );
        channel
            .queue_declare(
                exchange,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("声明队列 {exchange} 失败: {e}")))?;

        channel
            .queue_bind(
                exchange,
                exchange,
                &format!("{exchange}.#"),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("绑定队列 {exchange} 失败: {e}")))?;

        debug!("交换机与队列 {} 声明成功", exchange);
        Ok(())
    }

    pub fn routing_key(&self) -> String {
        routing_key_for(&self.config)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

/// 未配置路由键时使用 `<exchange>.default`
pub fn routing_key_for(config: &MessageQueueConfig) -> String {
    config
        .routing_key
        .clone()
        .unwrap_or_else(|| format!("{}.default", config.exchange))
}

/// 未指定优先级时使用队列允许的最高优先级
pub fn effective_priority(priority: Option<Priority>, max_priority: u8) -> u8 {
    priority
        .map(|p| p.value().min(max_priority))
        .unwrap_or(max_priority)
}

#[async_trait]
impl MessagePublisher for RabbitMqPublisher {
    async fn publish(
        &self,
        message: &DispatchMessage,
        priority: Option<Priority>,
    ) -> SchedulerResult<()> {
        let routing_key = self.routing_key();
        let payload = serde_json::to_vec(message)
            .map_err(|e| SchedulerError::Serialization(format!("序列化消息失败: {e}")))?;
        let priority = effective_priority(priority, self.config.max_priority);

        let channel = self.channel.lock().await;
        let result = async {
            let confirm = channel
                .basic_publish(
                    &self.config.exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_delivery_mode(2) // 2 = persistent
                        .with_priority(priority)
                        .with_content_type("application/json".into()),
                )
                .await?;
            confirm.await
        }
        .await;

        match result {
            Ok(_) => {
                info!(
                    "发布消息成功: exchange={}, routing_key={}, handler={}",
                    self.config.exchange, routing_key, message.handler
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "发布消息失败: exchange={}, routing_key={}, handler={}, error={}",
                    self.config.exchange, routing_key, message.handler, e
                );
                Err(SchedulerError::MessageQueue(format!("发布消息失败: {e}")))
            }
        }
    }

    async fn close(&self) -> SchedulerResult<()> {
        if !self.is_connected() {
            debug!("RabbitMQ连接已断开，跳过关闭");
            return Ok(());
        }

        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}
