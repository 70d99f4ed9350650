use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use crontask_domain::{
    AddTaskOutcome, CancelOutcome, NewTask, TaskFilter, TaskIdentity, TaskRecord, TaskService,
    TaskStatus, TaskUpdate,
};
use serde_json::{Map, Value};

/// 命令行入口
#[derive(Parser, Debug)]
#[command(name = "crontask")]
#[command(version)]
#[command(about = "持久化轮询式延迟任务调度系统")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    pub log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动执行器池，直到收到 SIGINT/SIGTERM
    Start {
        /// worker 数量，默认取配置
        #[arg(short, long)]
        worker_count: Option<usize>,
    },
    /// 登记新任务
    Add(TaskArgs),
    /// 修改仍在等待的任务
    Update(TaskArgs),
    /// 取消任务
    Cancel(IdentityArgs),
    /// 查看任务
    Show(IdentityArgs),
    /// 列出任务
    List {
        /// 状态过滤: waiting / pending / running / failed
        #[arg(short, long)]
        status: Option<String>,
        /// 任务名称过滤
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
        #[arg(long)]
        offset: Option<i64>,
    },
}

#[derive(Args, Debug)]
pub struct IdentityArgs {
    /// `<module>:<function>`
    pub task_name: String,
    pub task_attr: String,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    pub task_name: String,
    pub task_attr: String,
    /// RFC3339 时间，例如 2024-05-01T08:00:00Z
    #[arg(long)]
    pub run_at: Option<String>,
    /// JSON 数组
    #[arg(long)]
    pub args: Option<String>,
    /// JSON 对象
    #[arg(long)]
    pub kwargs: Option<String>,
    /// JSON 对象
    #[arg(long)]
    pub extra: Option<String>,
    #[arg(long)]
    pub remark: Option<String>,
}

impl TaskArgs {
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task_name.clone(), self.task_attr.clone())
    }

    pub fn to_new_task(&self) -> Result<NewTask> {
        let mut task = NewTask::new(self.task_name.clone(), self.task_attr.clone());
        task.run_at = self.run_at.as_deref().map(parse_run_at).transpose()?;
        task.task_args = self
            .args
            .as_deref()
            .map(parse_json_array)
            .transpose()?
            .unwrap_or_default();
        task.task_kwargs = self
            .kwargs
            .as_deref()
            .map(parse_json_object)
            .transpose()?
            .unwrap_or_default();
        task.extra = self
            .extra
            .as_deref()
            .map(parse_json_object)
            .transpose()?
            .unwrap_or_default();
        task.remark = self.remark.clone();
        Ok(task)
    }

    pub fn to_update(&self) -> Result<TaskUpdate> {
        Ok(TaskUpdate {
            run_at: self.run_at.as_deref().map(parse_run_at).transpose()?,
            task_args: self.args.as_deref().map(parse_json_array).transpose()?,
            task_kwargs: self.kwargs.as_deref().map(parse_json_object).transpose()?,
            extra: self.extra.as_deref().map(parse_json_object).transpose()?,
            remark: self.remark.clone(),
        })
    }
}

pub fn parse_run_at(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("无效的 RFC3339 时间: {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn parse_json_array(value: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(value).with_context(|| format!("无效的 JSON: {value}"))? {
        Value::Array(items) => Ok(items),
        other => Err(anyhow::anyhow!("需要 JSON 数组: {other}")),
    }
}

pub fn parse_json_object(value: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(value).with_context(|| format!("无效的 JSON: {value}"))? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow::anyhow!("需要 JSON 对象: {other}")),
    }
}

fn print_record(record: &TaskRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// 执行任务管理命令。任务已存在或已不存在都按正常结果输出。
pub async fn run_operator_command(service: &TaskService, command: Commands) -> Result<()> {
    match command {
        Commands::Start { .. } => Err(anyhow::anyhow!("start 不是任务管理命令")),
        Commands::Add(args) => {
            match service.add_task(args.to_new_task()?).await? {
                AddTaskOutcome::Created(record) => print_record(&record)?,
                AddTaskOutcome::AlreadyExists => {
                    println!("任务已存在: {}", args.identity());
                }
            }
            Ok(())
        }
        Commands::Update(args) => {
            let updated = service.update_task(&args.identity(), args.to_update()?).await?;
            println!("updated_task_count={updated}");
            Ok(())
        }
        Commands::Cancel(args) => {
            let identity = TaskIdentity::new(args.task_name, args.task_attr);
            match service.cancel_task(&identity).await? {
                CancelOutcome::Cancelled(count) => println!("canceled_task_count={count}"),
                CancelOutcome::NotFound => println!("任务不存在: {identity}"),
            }
            Ok(())
        }
        Commands::Show(args) => {
            let identity = TaskIdentity::new(args.task_name, args.task_attr);
            match service.find_task(&identity).await? {
                Some(record) => print_record(&record)?,
                None => println!("任务不存在: {identity}"),
            }
            Ok(())
        }
        Commands::List {
            status,
            name,
            limit,
            offset,
        } => {
            let filter = TaskFilter {
                status: status
                    .as_deref()
                    .map(str::parse::<TaskStatus>)
                    .transpose()?,
                task_name: name,
                limit: Some(limit),
                offset,
            };
            let records = service.list_tasks(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_with_global_flags() {
        let cli = Cli::try_parse_from([
            "crontask",
            "start",
            "--worker-count",
            "8",
            "--config",
            "dev.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("dev.toml"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(matches!(cli.command, Commands::Start { worker_count: Some(8) }));
    }

    #[test]
    fn test_parse_add_command() {
        let cli = Cli::try_parse_from([
            "crontask",
            "add",
            "jobs.send_email:run",
            "user-42",
            "--run-at",
            "2030-01-01T08:00:00+08:00",
            "--args",
            r#"["a@example.com"]"#,
            "--kwargs",
            r#"{"template":"welcome"}"#,
        ])
        .unwrap();

        let Commands::Add(args) = cli.command else {
            panic!("expected add command");
        };
        let task = args.to_new_task().unwrap();
        assert_eq!(task.task_name, "jobs.send_email:run");
        assert_eq!(task.run_at, Some(parse_run_at("2030-01-01T00:00:00Z").unwrap()));
        assert_eq!(task.task_args, vec![json!("a@example.com")]);
        assert_eq!(task.task_kwargs.get("template"), Some(&json!("welcome")));
        assert!(task.extra.is_empty());
    }

    #[test]
    fn test_update_only_sets_given_fields() {
        let cli =
            Cli::try_parse_from(["crontask", "update", "jobs.a:run", "x", "--remark", "later"])
                .unwrap();
        let Commands::Update(args) = cli.command else {
            panic!("expected update command");
        };
        let update = args.to_update().unwrap();
        assert_eq!(update.remark.as_deref(), Some("later"));
        assert!(update.run_at.is_none());
        assert!(update.task_args.is_none());
    }

    #[test]
    fn test_json_argument_shapes() {
        assert!(parse_json_array(r#"{"a":1}"#).is_err());
        assert!(parse_json_object("[1]").is_err());
        assert!(parse_json_object("not json").is_err());
        assert!(parse_run_at("yesterday").is_err());
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        assert!(Cli::try_parse_from(["crontask", "list", "--log-level", "loud"]).is_err());
    }
}
