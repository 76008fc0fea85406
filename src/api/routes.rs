use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use log::error;

use crate::api::model::*;
use crate::api::{ApiError, ApiResult, RouterState};
use crate::images::{ImageRecord, OsType};
use crate::network::{TapInfo, VmNetworkInfo};
use crate::resources::{
    ResourceAllocation, ResourceMetrics, ResourceQuota, ResourceRecommendation, SystemUsage,
};
use crate::vnc::{VncOptions, VncSessionInfo, VncType};

pub fn routes() -> Router<RouterState> {
    Router::new()
        // resources
        .route("/api/v1/resources/system/usage", get(v1_system_usage))
        .route("/api/v1/resources/allocate/{vm_name}", post(v1_allocate))
        .route(
            "/api/v1/resources/deallocate/{vm_name}",
            delete(v1_deallocate),
        )
        .route("/api/v1/resources/allocations", get(v1_list_allocations))
        .route(
            "/api/v1/resources/allocations/{vm_name}",
            get(v1_get_allocation),
        )
        .route(
            "/api/v1/resources/allocations/{vm_name}/usage",
            put(v1_update_usage),
        )
        .route(
            "/api/v1/resources/allocations/{vm_name}/resize",
            put(v1_resize),
        )
        .route(
            "/api/v1/resources/quotas/{user_id}",
            get(v1_get_quota).post(v1_set_quota),
        )
        .route(
            "/api/v1/resources/recommendations",
            get(v1_recommendations),
        )
        .route("/api/v1/resources/auto-scale", post(v1_resources_auto_scale))
        .route("/api/v1/resources/metrics", get(v1_resource_metrics))
        // network
        .route("/api/v1/network/interfaces", get(v1_list_interfaces))
        .route("/api/v1/network/setup", post(v1_network_setup))
        .route("/api/v1/network/teardown", post(v1_network_teardown))
        .route("/api/v1/network/vm/{vm_name}", get(v1_vm_network_info))
        .route(
            "/api/v1/network/vm/{vm_name}/tap",
            post(v1_create_tap).delete(v1_delete_tap),
        )
        .route(
            "/api/v1/network/vm/{vm_name}/port-forward",
            post(v1_create_port_forward).delete(v1_remove_port_forward),
        )
        // images
        .route("/api/v1/images", get(v1_list_images))
        .route("/api/v1/images/register", post(v1_register_image))
        .route(
            "/api/v1/images/windows",
            post(v1_create_windows_image),
        )
        .route(
            "/api/v1/images/linux-rootfs",
            post(v1_create_linux_rootfs),
        )
        .route(
            "/api/v1/images/{name}",
            get(v1_get_image).delete(v1_remove_image),
        )
        .route("/api/v1/images/{name}/verify", post(v1_verify_image))
        // vnc
        .route("/api/v1/vnc/start", post(v1_vnc_start))
        .route("/api/v1/vnc/stop", post(v1_vnc_stop))
        .route("/api/v1/vnc/info/{vm_name}", get(v1_vnc_info))
        .route("/api/v1/vnc/sessions", get(v1_vnc_sessions))
        .route("/api/v1/vnc/screenshot", post(v1_vnc_screenshot))
        .route("/api/v1/vnc/mouse/click", post(v1_vnc_mouse_click))
        .route("/api/v1/vnc/keyboard/keys", post(v1_vnc_send_keys))
        .route("/api/v1/vnc/keyboard/type", post(v1_vnc_type_text))
        // cluster
        .route("/api/v1/cluster/status", get(v1_cluster_status))
        .route("/api/v1/cluster/instances", get(v1_cluster_instances))
        .route(
            "/api/v1/cluster/instances/healthy",
            get(v1_cluster_healthy_instances),
        )
        .route("/api/v1/cluster/metrics", get(v1_cluster_metrics))
        .route("/api/v1/cluster/scale", post(v1_cluster_scale))
        .route("/api/v1/cluster/auto-scale", post(v1_cluster_auto_scale))
        .route(
            "/api/v1/cluster/load-balancing/config",
            get(v1_get_lb_config).put(v1_update_lb_config),
        )
        .route(
            "/api/v1/cluster/service-discovery/refresh",
            post(v1_refresh_discovery),
        )
        .route("/api/v1/cluster/health", get(v1_cluster_health))
        // health probes consumed by peers
        .route("/api/v1/health/ready", get(v1_health_ready))
        .route("/api/v1/health/metrics", get(v1_health_metrics))
}

// ---- resources -----------------------------------------------------------

async fn v1_system_usage(State(this): State<RouterState>) -> ApiResult<SystemUsage> {
    Ok(Json(this.resources.get_system_resources().await?))
}

async fn v1_allocate(
    Path(vm_name): Path<String>,
    Query(query): Query<UserQuery>,
    State(this): State<RouterState>,
    Json(req): Json<ResourceAllocationRequest>,
) -> ApiResult<ResourceAllocation> {
    if req.vcpus == 0 || req.memory_mb == 0 || req.disk_gb == 0 {
        return Err(ApiError::bad_request(
            "vcpus, memory_mb and disk_gb must be positive",
        ));
    }
    if !(1..=10).contains(&req.priority) {
        return Err(ApiError::bad_request("Priority must be between 1 and 10"));
    }
    let quota = this.resources.get_quota(&query.user_id).await;
    let granted = this
        .resources
        .allocate(
            &vm_name,
            req.vcpus,
            req.memory_mb,
            req.disk_gb,
            req.priority,
            Some(&quota),
        )
        .await?;
    if !granted {
        return Err(ApiError::bad_request(
            "Failed to allocate resources - insufficient resources or quota exceeded",
        ));
    }
    this.resources
        .get_allocation(&vm_name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::internal("Allocation failed unexpectedly"))
}

async fn v1_deallocate(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<MessageResponse> {
    if !this.resources.deallocate(&vm_name).await {
        return Err(ApiError::not_found(format!(
            "No resource allocation found for VM {}",
            vm_name
        )));
    }
    Ok(Json(MessageResponse {
        message: format!("Resources deallocated for VM {}", vm_name),
    }))
}

async fn v1_list_allocations(
    State(this): State<RouterState>,
) -> ApiResult<Vec<ResourceAllocation>> {
    Ok(Json(this.resources.list_allocations().await))
}

async fn v1_get_allocation(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<ResourceAllocation> {
    this.resources
        .get_allocation(&vm_name)
        .await
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(format!("No resource allocation found for VM {}", vm_name))
        })
}

async fn v1_update_usage(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
    Json(req): Json<UsageUpdateRequest>,
) -> ApiResult<MessageResponse> {
    for value in [req.cpu_usage_percent, req.memory_usage_percent] {
        if !(0.0..=100.0).contains(&value) {
            return Err(ApiError::bad_request(
                "Usage percentages must be between 0 and 100",
            ));
        }
    }
    if !this
        .resources
        .update_usage(&vm_name, req.cpu_usage_percent, req.memory_usage_percent)
        .await
    {
        return Err(ApiError::not_found(format!(
            "No resource allocation found for VM {}",
            vm_name
        )));
    }
    Ok(Json(MessageResponse {
        message: format!("Usage updated for VM {}", vm_name),
    }))
}

async fn v1_resize(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<ResourceAllocation> {
    if req.vcpus == Some(0) || req.memory_mb == Some(0) {
        return Err(ApiError::bad_request("vcpus and memory_mb must be positive"));
    }
    if this.resources.get_allocation(&vm_name).await.is_none() {
        return Err(ApiError::not_found(format!(
            "No resource allocation found for VM {}",
            vm_name
        )));
    }
    if !this
        .resources
        .resize(&vm_name, req.vcpus, req.memory_mb)
        .await?
    {
        return Err(ApiError::bad_request(
            "Failed to resize - request exceeds system limits or available resources",
        ));
    }
    this.resources
        .get_allocation(&vm_name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::internal("Resize failed unexpectedly"))
}

async fn v1_get_quota(
    Path(user_id): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<ResourceQuota> {
    Ok(Json(this.resources.get_quota(&user_id).await))
}

async fn v1_set_quota(
    Path(user_id): Path<String>,
    State(this): State<RouterState>,
    Json(req): Json<QuotaRequest>,
) -> ApiResult<ResourceQuota> {
    if req.max_vcpus == 0 || req.max_memory_mb == 0 || req.max_disk_gb == 0 || req.max_vms == 0 {
        return Err(ApiError::bad_request("Quota limits must be positive"));
    }
    if !(1..=10).contains(&req.priority) {
        return Err(ApiError::bad_request("Priority must be between 1 and 10"));
    }
    let quota = ResourceQuota {
        max_vcpus: req.max_vcpus,
        max_memory_mb: req.max_memory_mb,
        max_disk_gb: req.max_disk_gb,
        max_vms: req.max_vms,
        priority: req.priority,
    };
    this.resources.set_quota(&user_id, quota.clone()).await;
    Ok(Json(quota))
}

async fn v1_recommendations(
    State(this): State<RouterState>,
) -> ApiResult<Vec<ResourceRecommendation>> {
    Ok(Json(this.resources.get_recommendations().await?))
}

async fn v1_resources_auto_scale(
    State(this): State<RouterState>,
) -> ApiResult<AutoScaleResourcesResponse> {
    let scaled_vms = this.resources.auto_scale().await?;
    Ok(Json(AutoScaleResourcesResponse {
        message: format!("Auto-scaling completed, {} VM(s) resized", scaled_vms.len()),
        scaled_vms,
    }))
}

async fn v1_resource_metrics(State(this): State<RouterState>) -> ApiResult<ResourceMetrics> {
    Ok(Json(this.resources.export_metrics().await?))
}

// ---- network -------------------------------------------------------------

async fn v1_list_interfaces(State(this): State<RouterState>) -> ApiResult<InterfaceListResponse> {
    Ok(Json(InterfaceListResponse {
        interfaces: this.network.list_network_interfaces().await?,
    }))
}

async fn v1_network_setup(State(this): State<RouterState>) -> ApiResult<MessageResponse> {
    this.network.setup_bridge().await?;
    Ok(Json(MessageResponse {
        message: "Bridge network setup completed".to_string(),
    }))
}

async fn v1_network_teardown(State(this): State<RouterState>) -> ApiResult<MessageResponse> {
    this.network.teardown_bridge().await?;
    Ok(Json(MessageResponse {
        message: "Bridge network torn down".to_string(),
    }))
}

async fn v1_vm_network_info(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<VmNetworkInfo> {
    this.network
        .get_vm_network_info(&vm_name)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(format!("VM '{}' network interface not found", vm_name))
        })
}

async fn v1_create_tap(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<TapInfo> {
    Ok(Json(this.network.create_tap(&vm_name).await?))
}

async fn v1_delete_tap(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<MessageResponse> {
    this.network.delete_tap(&vm_name).await?;
    Ok(Json(MessageResponse {
        message: format!("Network interface removed for VM {}", vm_name),
    }))
}

async fn v1_create_port_forward(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
    Json(req): Json<PortForwardRequest>,
) -> ApiResult<PortForwardResponse> {
    let host_port = this
        .network
        .allocate_port_forward(&vm_name, req.guest_port)
        .await?;
    Ok(Json(PortForwardResponse {
        message: format!(
            "Port forward created: host:{} -> {}:{}",
            host_port, vm_name, req.guest_port
        ),
        vm_name,
        guest_port: req.guest_port,
        host_port,
    }))
}

async fn v1_remove_port_forward(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
    Json(req): Json<PortForwardRemoveRequest>,
) -> ApiResult<MessageResponse> {
    this.network
        .remove_port_forward(&vm_name, req.guest_port)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("Port forward removed for {}:{}", vm_name, req.guest_port),
    }))
}

// ---- images --------------------------------------------------------------

async fn v1_list_images(
    Query(query): Query<ImageListQuery>,
    State(this): State<RouterState>,
) -> ApiResult<Vec<ImageRecord>> {
    Ok(Json(this.images.list(query.os_type).await))
}

async fn v1_register_image(
    State(this): State<RouterState>,
    Json(req): Json<RegisterImageRequest>,
) -> ApiResult<ImageRecord> {
    this.images
        .register(
            &req.name,
            std::path::Path::new(&req.path),
            req.os_type,
            req.metadata,
        )
        .await
        .map(Json)
        .map_err(ApiError::bad_request)
}

async fn v1_get_image(
    Path(name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<ImageRecord> {
    this.images
        .get(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Image '{}' not found", name)))
}

async fn v1_remove_image(
    Path(name): Path<String>,
    Query(query): Query<RemoveImageQuery>,
    State(this): State<RouterState>,
) -> ApiResult<MessageResponse> {
    if this.images.get(&name).await.is_none() {
        return Err(ApiError::not_found(format!("Image '{}' not found", name)));
    }
    this.images.remove(&name, query.delete_file).await?;
    Ok(Json(MessageResponse {
        message: format!("Image '{}' removed from registry", name),
    }))
}

async fn v1_create_windows_image(
    State(this): State<RouterState>,
    Json(req): Json<CreateWindowsImageRequest>,
) -> ApiResult<ImageCreateResponse> {
    let path = this
        .images
        .create_windows_image(&req.name, req.size_gb, &req.format)
        .await?;
    Ok(Json(ImageCreateResponse {
        message: format!("Windows image '{}' created", req.name),
        name: req.name,
        path: path.display().to_string(),
    }))
}

async fn v1_create_linux_rootfs(
    State(this): State<RouterState>,
    Json(req): Json<CreateLinuxRootfsRequest>,
) -> ApiResult<ImageCreateResponse> {
    let path = this
        .images
        .create_linux_rootfs(&req.name, req.size_mb, &req.format)
        .await?;
    Ok(Json(ImageCreateResponse {
        message: format!("Linux rootfs '{}' created", req.name),
        name: req.name,
        path: path.display().to_string(),
    }))
}

async fn v1_verify_image(
    Path(name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<ImageVerifyResponse> {
    if this.images.get(&name).await.is_none() {
        return Err(ApiError::not_found(format!("Image '{}' not found", name)));
    }
    let valid = this.images.verify_integrity(&name).await?;
    Ok(Json(ImageVerifyResponse { name, valid }))
}

// ---- vnc -----------------------------------------------------------------

async fn v1_vnc_start(
    State(this): State<RouterState>,
    Json(req): Json<VncStartRequest>,
) -> ApiResult<VncSessionInfo> {
    let os_type = req.os_type.unwrap_or(OsType::Linux);
    let options = VncOptions {
        password: req.password,
        performance_mode: req.performance_mode,
        port: req.port,
    };
    Ok(Json(this.vnc.start(&req.vm_name, os_type, options).await?))
}

async fn v1_vnc_stop(
    State(this): State<RouterState>,
    Json(req): Json<VncStopRequest>,
) -> ApiResult<MessageResponse> {
    if !this.vnc.stop(&req.vm_name).await? {
        return Err(ApiError::not_found(format!(
            "No VNC session found for VM '{}'",
            req.vm_name
        )));
    }
    Ok(Json(MessageResponse {
        message: format!("VNC server stopped for VM '{}'", req.vm_name),
    }))
}

async fn v1_vnc_info(
    Path(vm_name): Path<String>,
    State(this): State<RouterState>,
) -> ApiResult<VncSessionInfo> {
    this.vnc.get_info(&vm_name).await?.map(Json).ok_or_else(|| {
        ApiError::not_found(format!("No VNC session found for VM '{}'", vm_name))
    })
}

async fn v1_vnc_sessions(State(this): State<RouterState>) -> ApiResult<Vec<VncSessionInfo>> {
    Ok(Json(this.vnc.list_sessions().await?))
}

async fn v1_vnc_screenshot(
    State(this): State<RouterState>,
    Json(req): Json<ScreenshotRequest>,
) -> ApiResult<ScreenshotResponse> {
    ensure_vnc_session(&this, &req.vm_name).await?;
    let image = this.vnc.take_screenshot(&req.vm_name).await?;
    Ok(Json(ScreenshotResponse {
        vm_name: req.vm_name,
        format: req.format,
        image_data: BASE64.encode(image),
    }))
}

async fn v1_vnc_mouse_click(
    State(this): State<RouterState>,
    Json(req): Json<MouseClickRequest>,
) -> ApiResult<MessageResponse> {
    ensure_vnc_session(&this, &req.vm_name).await?;
    this.vnc
        .mouse_click(&req.vm_name, req.x, req.y, req.button)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("Mouse click at ({}, {}) sent to VM '{}'", req.x, req.y, req.vm_name),
    }))
}

async fn v1_vnc_send_keys(
    State(this): State<RouterState>,
    Json(req): Json<KeyCombinationRequest>,
) -> ApiResult<MessageResponse> {
    ensure_vnc_session(&this, &req.vm_name).await?;
    this.vnc.send_keys(&req.vm_name, &req.keys).await?;
    Ok(Json(MessageResponse {
        message: format!("Keys '{}' sent to VM '{}'", req.keys, req.vm_name),
    }))
}

async fn v1_vnc_type_text(
    State(this): State<RouterState>,
    Json(req): Json<TypeTextRequest>,
) -> ApiResult<MessageResponse> {
    let info = this.vnc.get_info(&req.vm_name).await?.ok_or_else(|| {
        ApiError::not_found(format!("No VNC session found for VM '{}'", req.vm_name))
    })?;
    if info.vnc_type == VncType::Hypervisor {
        return Err(ApiError::bad_request(
            "Text input is not supported for hypervisor VNC sessions; use key combinations",
        ));
    }
    this.vnc.type_text(&req.vm_name, &req.text).await?;
    Ok(Json(MessageResponse {
        message: format!("Text typed to VM '{}'", req.vm_name),
    }))
}

async fn ensure_vnc_session(this: &RouterState, vm_name: &str) -> Result<(), ApiError> {
    if this.vnc.get_info(vm_name).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "No VNC session found for VM '{}'",
            vm_name
        )));
    }
    Ok(())
}

// ---- cluster -------------------------------------------------------------

async fn v1_cluster_status(State(this): State<RouterState>) -> ApiResult<ClusterStatusResponse> {
    let snapshot = this.balancer.cluster_snapshot().await;
    let metrics = this.scaler.current_metrics().await;
    let current_replicas = this.scaler.current_replicas().await;
    let config = this.scaler.config();

    Ok(Json(ClusterStatusResponse {
        total_instances: snapshot.total_instances,
        healthy_instances: snapshot.healthy_instances,
        unhealthy_instances: snapshot.unhealthy_instances,
        instances: snapshot.instances,
        load_balancing_config: snapshot.load_balancing_config,
        connection_counts: snapshot.connection_counts,
        scaling_config: ScalingConfigInfo {
            current_replicas,
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas,
            target_cpu_percent: config.target_cpu_percent,
            target_memory_percent: config.target_memory_percent,
        },
        metrics,
    }))
}

async fn v1_cluster_instances(
    State(this): State<RouterState>,
) -> ApiResult<Vec<crate::cluster::ServiceInstance>> {
    Ok(Json(this.discovery.discover_instances().await))
}

async fn v1_cluster_healthy_instances(
    State(this): State<RouterState>,
) -> ApiResult<Vec<crate::cluster::ServiceInstance>> {
    Ok(Json(this.discovery.healthy_instances().await))
}

async fn v1_cluster_metrics(State(this): State<RouterState>) -> ApiResult<ScalingMetricsResponse> {
    let metrics = this.scaler.current_metrics().await;
    let current_replicas = this.scaler.current_replicas().await;
    let config = this.scaler.config();

    let should_scale_up = this.scaler.should_scale_up(&metrics, current_replicas);
    let should_scale_down = this.scaler.should_scale_down(&metrics, current_replicas);
    let reason = if should_scale_up {
        "Scale up recommended due to high resource usage"
    } else if should_scale_down {
        "Scale down recommended due to low resource usage"
    } else {
        "No scaling action recommended"
    };

    Ok(Json(ScalingMetricsResponse {
        cpu_usage: metrics.cpu_usage,
        memory_usage: metrics.memory_usage,
        request_rate: metrics.request_rate,
        current_replicas,
        min_replicas: config.min_replicas,
        max_replicas: config.max_replicas,
        target_cpu_percent: config.target_cpu_percent,
        target_memory_percent: config.target_memory_percent,
        scaling_recommendation: ScalingRecommendation {
            should_scale_up,
            should_scale_down,
            reason: reason.to_string(),
        },
    }))
}

async fn v1_cluster_scale(
    State(this): State<RouterState>,
    Json(req): Json<ScalingActionRequest>,
) -> ApiResult<ScaleResponse> {
    let config = this.scaler.config();
    let current_replicas = this.scaler.current_replicas().await;

    let target_replicas = match req.action {
        ScaleAction::Up => {
            let target = (current_replicas + req.replicas).min(config.max_replicas);
            if target == current_replicas {
                return Err(ApiError::bad_request(format!(
                    "Cannot scale up: already at maximum replicas ({})",
                    config.max_replicas
                )));
            }
            target
        }
        ScaleAction::Down => {
            let target = current_replicas
                .saturating_sub(req.replicas)
                .max(config.min_replicas);
            if target == current_replicas {
                return Err(ApiError::bad_request(format!(
                    "Cannot scale down: already at minimum replicas ({})",
                    config.min_replicas
                )));
            }
            target
        }
        ScaleAction::Set => {
            if req.replicas < config.min_replicas || req.replicas > config.max_replicas {
                return Err(ApiError::bad_request(format!(
                    "Target replicas must be between {} and {}",
                    config.min_replicas, config.max_replicas
                )));
            }
            req.replicas
        }
    };

    if !this.scaler.scale_to(target_replicas).await {
        return Err(ApiError::internal("Failed to execute scaling action"));
    }
    Ok(Json(ScaleResponse {
        message: format!(
            "Scaling action '{}' executed successfully",
            req.action.as_str()
        ),
        target_replicas,
        action: req.action,
    }))
}

async fn v1_cluster_auto_scale(
    State(this): State<RouterState>,
) -> ApiResult<ClusterAutoScaleResponse> {
    let outcome = this.scaler.auto_scale().await;
    Ok(Json(ClusterAutoScaleResponse {
        message: "Auto-scaling evaluation completed".to_string(),
        action_taken: outcome.action,
        current_replicas: outcome.current_replicas,
        new_replicas: outcome.new_replicas,
        metrics: outcome.metrics,
        thresholds: outcome.thresholds,
    }))
}

async fn v1_get_lb_config(
    State(this): State<RouterState>,
) -> ApiResult<crate::cluster::LoadBalancerConfig> {
    Ok(Json(this.balancer.get_config().await))
}

async fn v1_update_lb_config(
    State(this): State<RouterState>,
    Json(config): Json<crate::cluster::LoadBalancerConfig>,
) -> ApiResult<crate::cluster::LoadBalancerConfig> {
    this.balancer.update_config(config.clone()).await;
    Ok(Json(config))
}

async fn v1_refresh_discovery(
    State(this): State<RouterState>,
) -> ApiResult<DiscoveryRefreshResponse> {
    let instances = this.discovery.refresh().await;
    let healthy = instances
        .iter()
        .filter(|i| i.status == crate::cluster::InstanceStatus::Healthy)
        .count();
    Ok(Json(DiscoveryRefreshResponse {
        message: "Service discovery refreshed successfully".to_string(),
        discovered_instances: instances.len(),
        healthy_instances: healthy,
        instances,
    }))
}

async fn v1_cluster_health(State(this): State<RouterState>) -> Json<ClusterHealthResponse> {
    let healthy = this.discovery.healthy_instances().await.len();
    let current_replicas = this.scaler.current_replicas().await;
    Json(ClusterHealthResponse {
        status: if healthy > 0 { "healthy" } else { "unhealthy" }.to_string(),
        healthy_instances: healthy,
        current_replicas,
        timestamp: Utc::now(),
    })
}

// ---- health --------------------------------------------------------------

async fn v1_health_ready(State(this): State<RouterState>) -> ApiResult<ReadyResponse> {
    let usage = this.resources.get_system_resources().await.map_err(|e| {
        error!("Readiness probe failed: {}", e);
        ApiError::internal(e)
    })?;
    Ok(Json(ReadyResponse {
        status: "ready".to_string(),
        metrics: HealthMetrics {
            cpu_usage_percent: usage.cpu_usage_percent,
            memory_usage_percent: usage.memory_usage_percent,
        },
    }))
}

async fn v1_health_metrics(State(this): State<RouterState>) -> ApiResult<HealthMetricsResponse> {
    let usage = this.resources.get_system_resources().await?;
    Ok(Json(HealthMetricsResponse {
        cpu_usage_percent: usage.cpu_usage_percent,
        memory_usage_percent: usage.memory_usage_percent,
        requests_per_second: this.stats.requests_per_second(),
    }))
}
