// Integration tests require a running Kubernetes cluster. These tests are
// ignored by default.

use std::collections::BTreeMap;
use std::time::Duration;

use beamlit_operator::config::GatewayServiceConfig;
use beamlit_operator::crd::ServiceReference;
use beamlit_operator::dataplane::configurer::{
    DEFAULT_SLICE_CONTROLLER, LABEL_SLICE_MANAGED_BY, ServiceConfigurer,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];

fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

async fn create_backing_workload(client: Client, ns: &str, name: &str) {
    let dep_api: Api<Deployment> = Api::namespaced(client.clone(), ns);
    let dep = Deployment {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(name)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(name)),
                ..Default::default()
            },
            template: k8s_openapi::api::core::v1::PodTemplateSpec {
                metadata: Some(kube::core::ObjectMeta {
                    labels: Some(labels(name)),
                    ..Default::default()
                }),
                spec: Some(k8s_openapi::api::core::v1::PodSpec {
                    containers: vec![k8s_openapi::api::core::v1::Container {
                        name: "main".into(),
                        image: Some("nginx:alpine".into()),
                        ports: Some(vec![
                            k8s_openapi::api::core::v1::ContainerPort {
                                container_port: 80,
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    dep_api
        .create(&PostParams::default(), &dep)
        .await
        .expect("create deployment");

    let svc_api: Api<Service> = Api::namespaced(client.clone(), ns);
    let svc = Service {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: 80,
                target_port: Some(IntOrString::Int(80)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    svc_api
        .create(&PostParams::default(), &svc)
        .await
        .expect("create service");
}

async fn create_gateway_service(client: Client, ns: &str, name: &str) {
    let svc_api: Api<Service> = Api::namespaced(client, ns);
    let svc = Service {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("proxy".into()),
                port: 8000,
                target_port: Some(IntOrString::Int(8000)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    svc_api
        .create(&PostParams::default(), &svc)
        .await
        .expect("create gateway service");
}

async fn wait_for_slice(client: Client, ns: &str, service: &str) {
    let api: Api<EndpointSlice> = Api::namespaced(client, ns);
    for _ in 0..60 {
        if let Ok(list) = api
            .list(
                &ListParams::default()
                    .labels(&format!("kubernetes.io/service-name={service}")),
            )
            .await
        {
            if list.items.iter().any(|s| !s.endpoints.is_empty()) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    panic!("endpoint slice for {ns}/{service} never populated");
}

#[tokio::test]
#[ignore]
async fn configure_and_unconfigure_round_trip() {
    let client = Client::try_default().await.expect("kube client");
    let ns = "default";
    let name = format!("blt-it-{}", nanoid::nanoid!(6, &DIGITS));
    let gateway_name = format!("{name}-gw");

    create_backing_workload(client.clone(), ns, &name).await;
    create_gateway_service(client.clone(), ns, &gateway_name).await;
    wait_for_slice(client.clone(), ns, &name).await;

    let configurer = ServiceConfigurer::new(
        client.clone(),
        GatewayServiceConfig {
            namespace: ns.to_string(),
            name: gateway_name.clone(),
            port: 8000,
            admin_port: 8080,
        },
        ns,
    );
    let service_ref = ServiceReference {
        namespace: Some(ns.to_string()),
        name: name.clone(),
        target_port: 80,
    };

    configurer.configure(&service_ref).await.expect("configure");
    // the shadow needs its own slice before mirroring settles
    wait_for_slice(client.clone(), ns, &format!("{name}-beamlit")).await;
    configurer.configure(&service_ref).await.expect("reconfigure");

    let svc_api: Api<Service> = Api::namespaced(client.clone(), ns);
    let user = svc_api.get(&name).await.expect("user service");
    let cluster_ip = user
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .expect("cluster ip");

    let shadow = svc_api
        .get(&format!("{name}-beamlit"))
        .await
        .expect("shadow service");
    assert_eq!(
        shadow.spec.as_ref().and_then(|s| s.selector.clone()),
        user.spec.as_ref().and_then(|s| s.selector.clone())
    );

    let gateway = svc_api.get(&gateway_name).await.expect("gateway");
    let external_ips = gateway
        .spec
        .as_ref()
        .and_then(|s| s.external_ips.clone())
        .unwrap_or_default();
    assert!(external_ips.contains(&cluster_ip));
    assert!(gateway
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().any(|p| p.port == 80))
        .unwrap_or(false));

    let slice_api: Api<EndpointSlice> = Api::namespaced(client.clone(), ns);
    let mirrored = slice_api
        .get(&format!("{name}-beamlit-mirrored"))
        .await
        .expect("mirrored slice");
    assert!(!mirrored.endpoints.is_empty());

    let shadow_ref = configurer.local_shadow(&service_ref).expect("shadow ref");
    assert_eq!(shadow_ref.name, format!("{name}-beamlit"));
    assert_eq!(shadow_ref.target_port, 80);

    configurer
        .unconfigure(&service_ref)
        .await
        .expect("unconfigure");

    assert!(svc_api.get_opt(&format!("{name}-beamlit")).await.unwrap().is_none());
    assert!(slice_api
        .get_opt(&format!("{name}-beamlit-mirrored"))
        .await
        .unwrap()
        .is_none());
    let gateway = svc_api.get(&gateway_name).await.expect("gateway");
    let external_ips = gateway
        .spec
        .as_ref()
        .and_then(|s| s.external_ips.clone())
        .unwrap_or_default();
    assert!(!external_ips.contains(&cluster_ip));
    let originals = slice_api
        .list(
            &ListParams::default()
                .labels(&format!("kubernetes.io/service-name={name}")),
        )
        .await
        .expect("list slices");
    assert!(originals.items.iter().all(|s| {
        s.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SLICE_MANAGED_BY))
            .map(String::as_str)
            == Some(DEFAULT_SLICE_CONTROLLER)
    }));

    // best-effort cleanup
    let dep_api: Api<Deployment> = Api::namespaced(client.clone(), ns);
    let _ = dep_api.delete(&name, &DeleteParams::default()).await;
    let _ = svc_api.delete(&name, &DeleteParams::default()).await;
    let _ = svc_api.delete(&gateway_name, &DeleteParams::default()).await;
}
