use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

type Client = Framed<TcpStream, LinesCodec>;

async fn connect(host: &str, port: u16) -> Client {
    let socket = TcpStream::connect((host, port)).await.expect("connect failed");
    Framed::new(socket, LinesCodec::new())
}

async fn call(client: &mut Client, request: &Value) -> Value {
    client.send(request.to_string()).await.expect("send failed");
    let line = client.next().await.expect("server closed").expect("read failed");
    serde_json::from_str(&line).expect("invalid response")
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Fresh employee with room for every allocation the phase writes, plus one project.
async fn setup(client: &mut Client, capacity: f64) -> (Ulid, Ulid) {
    let (employee, project) = (Ulid::new(), Ulid::new());
    call(
        client,
        &json!({"op": "upsert_employee", "id": employee.to_string(), "weekly_capacity_hours": capacity}),
    )
    .await;
    call(client, &json!({"op": "upsert_project", "id": project.to_string()})).await;
    (employee, project)
}

/// `n` one-week allocations on consecutive weeks starting at `from`.
fn weekly_allocations(employee: Ulid, project: Ulid, n: usize) -> Vec<Value> {
    let from = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
    (0..n)
        .map(|i| {
            let start = from + Days::new(7 * i as u64);
            let end = start + Days::new(4);
            json!({
                "employee_id": employee.to_string(),
                "project_id": project.to_string(),
                "start_date": start.to_string(),
                "end_date": end.to_string(),
                "allocated_hours": 20.0,
            })
        })
        .collect()
}

async fn phase1_sequential(host: &str, port: u16) {
    let mut client = connect(host, port).await;
    let (employee, project) = setup(&mut client, 40.0).await;

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for allocation in weekly_allocations(employee, project, n) {
        let t = Instant::now();
        let r = call(&mut client, &json!({"op": "bulk_create", "allocations": [allocation]})).await;
        assert_eq!(r["ok"]["status"], "completed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} single-item jobs in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("job latency", &mut latencies);
}

async fn phase2_chunked(host: &str, port: u16) {
    let mut client = connect(host, port).await;

    for chunk_size in [10, 100, 500] {
        let (employee, project) = setup(&mut client, 40.0).await;
        let n = 1000;
        let request = json!({
            "op": "bulk_create",
            "allocations": weekly_allocations(employee, project, n),
            "options": {"chunk_size": chunk_size},
        });
        let start = Instant::now();
        let r = call(&mut client, &request).await;
        let elapsed = start.elapsed();
        let committed = r["ok"]["successful"].as_array().map_or(0, |s| s.len());
        println!(
            "  chunk_size={chunk_size}: {committed}/{n} allocations in {:.2}s = {:.0} items/sec",
            elapsed.as_secs_f64(),
            committed as f64 / elapsed.as_secs_f64()
        );
    }
}

async fn phase3_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let mut client = connect(&host, port).await;
            let (employee, project) = setup(&mut client, 40.0).await;
            for allocation in weekly_allocations(employee, project, n_per_task) {
                call(&mut client, &json!({"op": "bulk_create", "allocations": [allocation]})).await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} jobs = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase4_contended(host: &str, port: u16) {
    // Every task writes the same week for one employee; capacity admits
    // only a few of them.
    let mut setup_client = connect(host, port).await;
    let (employee, project) = setup(&mut setup_client, 40.0).await;
    let allocation = weekly_allocations(employee, project, 1).remove(0);

    let n_tasks = 20;
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let allocation = allocation.clone();
        handles.push(tokio::spawn(async move {
            let mut client = connect(&host, port).await;
            let r = call(&mut client, &json!({"op": "bulk_create", "allocations": [allocation]})).await;
            r["ok"]["status"] == "completed"
        }));
    }

    let mut committed = 0;
    for h in handles {
        if h.await.unwrap_or(false) {
            committed += 1;
        }
    }
    println!(
        "  {n_tasks} racing writers: {committed} committed in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

async fn phase5_read_under_load(host: &str, port: u16) {
    let mut setup_client = connect(host, port).await;
    let (employee, project) = setup(&mut setup_client, 40.0).await;
    call(
        &mut setup_client,
        &json!({"op": "bulk_create", "allocations": weekly_allocations(employee, project, 200)}),
    )
    .await;

    let host_w = host.to_string();
    let writer = tokio::spawn(async move {
        let mut client = connect(&host_w, port).await;
        let (employee, project) = setup(&mut client, 40.0).await;
        for allocation in weekly_allocations(employee, project, 300) {
            call(&mut client, &json!({"op": "bulk_create", "allocations": [allocation]})).await;
        }
    });

    let mut reader = connect(host, port).await;
    let query = json!({"op": "list_allocations", "employee_id": employee.to_string()});
    let mut latencies = Vec::with_capacity(500);
    for _ in 0..500 {
        let t = Instant::now();
        call(&mut reader, &query).await;
        latencies.push(t.elapsed());
    }
    let _ = writer.await;
    print_latency("list latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ALLOCD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOCD_PORT")
        .unwrap_or_else(|_| "5480".into())
        .parse()
        .expect("invalid ALLOCD_PORT");

    println!("=== allocd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential single-item jobs");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] one large job per chunk size");
    phase2_chunked(&host, port).await;

    println!("\n[phase 3] concurrent writers, disjoint employees");
    phase3_concurrent(&host, port).await;

    println!("\n[phase 4] concurrent writers, one employee");
    phase4_contended(&host, port).await;

    println!("\n[phase 5] list latency under write load");
    phase5_read_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
