use std::sync::Arc;

use offline_media_cache::testing::MockNetwork;
use offline_media_cache::{
    CacheConfig, CacheEntry, CacheKey, CacheStore, Destination, DiskStore, FetchRequest,
    FetchResponse, Message, Network, ServiceWorker, Song, WorkerHandle, WorkerState,
};
use reqwest::header;
use reqwest::{StatusCode, Url};
use tempfile::TempDir;

const ORIGIN: &str = "https://hymns.example/";

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn key(path: &str) -> CacheKey {
    CacheKey::resolve(path, &Url::parse(ORIGIN).unwrap()).unwrap()
}

fn config(dir: &TempDir, generation: &str) -> CacheConfig {
    CacheConfig::default()
        .with_origin(ORIGIN)
        .with_generation_id(generation)
        .with_core_assets(["/", "/index.html"])
        .with_cache_dir(dir.path())
}

fn site() -> Arc<MockNetwork> {
    let network = Arc::new(MockNetwork::new());
    network.serve_ok("/", "<html>root</html>", "text/html");
    network.serve_ok("/index.html", "<html>shell</html>", "text/html");
    network
}

async fn active_worker(dir: &TempDir, network: &Arc<MockNetwork>) -> ServiceWorker {
    let store: Arc<dyn CacheStore> = Arc::new(DiskStore::new(dir.path()));
    let worker = ServiceWorker::new(
        config(dir, "v_new"),
        store,
        Arc::clone(network) as Arc<dyn Network>,
    )
    .unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    worker
}

#[tokio::test]
async fn install_activate_then_serve_shell_offline() {
    let dir = TempDir::new().unwrap();
    let store = DiskStore::new(dir.path());
    store.create_generation("v_old").await.unwrap();
    store
        .put("v_old", CacheEntry::new(key("/index.html"), "stale", Some("text/html")))
        .await
        .unwrap();

    let network = site();
    let worker = active_worker(&dir, &network).await;
    assert_eq!(worker.state(), WorkerState::Active);
    assert_eq!(store.generations().await.unwrap(), vec!["v_new".to_string()]);

    network.set_offline(true);
    let shell = worker
        .handle_fetch(&FetchRequest::get(url("/index.html")))
        .await
        .unwrap();
    assert_eq!(&shell.body[..], b"<html>shell</html>");

    let navigation = worker
        .handle_fetch(&FetchRequest::get(url("/hymns/42")).with_destination(Destination::Document))
        .await
        .unwrap();
    assert_eq!(&navigation.body[..], b"<html>shell</html>");
}

#[tokio::test]
async fn seek_into_cached_song() {
    let dir = TempDir::new().unwrap();
    let network = site();
    let song: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    network.serve_ok("/song.mp3", song.clone(), "audio/mpeg");
    let worker = active_worker(&dir, &network).await;

    worker
        .handle_fetch(&FetchRequest::get(url("/song.mp3")))
        .await
        .unwrap();
    network.set_offline(true);

    let response = worker
        .handle_fetch(&FetchRequest::get(url("/song.mp3")).with_range("bytes=1000-1999"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.header(&header::CONTENT_RANGE), Some("bytes 1000-1999/5000"));
    assert_eq!(response.header(&header::CONTENT_LENGTH), Some("1000"));
    assert_eq!(&response.body[..], &song[1000..2000]);
}

#[tokio::test]
async fn partial_network_response_never_replaces_full_entry() {
    let dir = TempDir::new().unwrap();
    let network = site();
    let worker = active_worker(&dir, &network).await;
    let generation = worker.generation().unwrap().clone();

    network.serve(
        "/clip.mp3",
        FetchResponse::new(StatusCode::PARTIAL_CONTENT, vec![0xAA; 100])
            .with_header(header::CONTENT_RANGE, "bytes 0-99/900"),
    );
    let response = worker
        .handle_fetch(&FetchRequest::get(url("/clip.mp3")).with_destination(Destination::Audio))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert!(generation.get(&key("/clip.mp3")).await.unwrap().is_none());

    generation
        .put(CacheEntry::new(key("/clip.mp3"), vec![0x11; 900], Some("audio/mpeg")))
        .await
        .unwrap();
    let stored = generation.get(&key("/clip.mp3")).await.unwrap().unwrap();
    assert_eq!(stored.body.len(), 900);
    assert!(stored.body.iter().all(|b| *b == 0x11));
}

#[tokio::test]
async fn bulk_job_with_one_failure_reports_the_rest() {
    let dir = TempDir::new().unwrap();
    let network = site();
    let songs: Vec<Song> = (1..=5)
        .map(|i| Song::new(format!("/hymns/{i}.mp3"), format!("Hymn {i}")))
        .collect();
    for song in &songs {
        network.serve_ok(&song.url, vec![1u8; 256], "audio/mpeg");
    }
    network.fail("/hymns/3.mp3");

    let worker = Arc::new(active_worker(&dir, &network).await);
    let (handle, _events) = WorkerHandle::spawn(Arc::clone(&worker));
    let (client, mut rx) = worker.clients().connect();
    handle
        .post_message(client, Message::CacheSongs { songs })
        .await
        .unwrap();

    let mut progress = 0;
    let count = loop {
        match rx.recv().await {
            Some(Message::CacheProgress { .. }) => progress += 1,
            Some(Message::CacheComplete { count }) => break count,
            Some(Message::CacheSongs { .. }) | None => panic!("unexpected end of notifications"),
        }
    };
    assert_eq!(count, Some(4));
    assert_eq!(progress, 5);

    let entries = worker.generation().unwrap().list().await.unwrap();
    assert_eq!(entries.len(), 6);
    assert!(entries.iter().all(|e| e.key != key("/hymns/3.mp3")));
}

#[tokio::test]
async fn cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let network = site();
    network.serve_ok("/a.mp3", vec![5u8; 64], "audio/mpeg");
    {
        let worker = active_worker(&dir, &network).await;
        worker.handle_fetch(&FetchRequest::get(url("/a.mp3"))).await.unwrap();
    }

    network.set_offline(true);
    let store: Arc<dyn CacheStore> = Arc::new(DiskStore::new(dir.path()));
    let entry = store.get("v_new", &key("/a.mp3")).await.unwrap().unwrap();
    assert_eq!(entry.body.len(), 64);
    assert_eq!(entry.content_type.as_deref(), Some("audio/mpeg"));
}

#[tokio::test]
async fn failed_upgrade_keeps_serving_previous_generation() {
    let dir = TempDir::new().unwrap();
    let network = site();
    let store: Arc<dyn CacheStore> = Arc::new(DiskStore::new(dir.path()));
    let v1 = ServiceWorker::new(
        config(&dir, "v1"),
        Arc::clone(&store),
        Arc::clone(&network) as Arc<dyn Network>,
    )
    .unwrap()
    .start()
    .await
    .unwrap();
    assert_eq!(v1.state(), WorkerState::Active);
    drop(v1);

    network.set_offline(true);
    let serving = ServiceWorker::new(
        config(&dir, "v2"),
        Arc::clone(&store),
        Arc::clone(&network) as Arc<dyn Network>,
    )
    .unwrap()
    .start()
    .await
    .unwrap();
    assert_eq!(serving.generation_id(), "v1");
    assert_eq!(store.generations().await.unwrap(), vec!["v1".to_string()]);

    let navigation = FetchRequest::get(url("/hymns/42")).with_destination(Destination::Document);
    let response = serving.handle_fetch(&navigation).await.unwrap();
    assert_eq!(&response.body[..], b"<html>shell</html>");
}
